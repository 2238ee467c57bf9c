use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use reward_cli::protocol::{Action, Reply, handle_frame};
use reward_cli::server::{MAX_FRAME, Server};
use reward_core::{Controller, ControllerOptions, Holder};
use reward_hardware::SimBoard;
use reward_traits::TestClock;
use rstest::rstest;
use serde_json::{Value, json};
use tempfile::TempDir;

fn controller(dir: &TempDir) -> (Arc<SimBoard>, Controller) {
    let root = dir.path().display();
    let text = format!(
        r#"
state_dir = '{root}/state'
data_dir = '{root}/data'

[speakers.left]
sd_pin = 12
channel = 0

[pumps.pumpA]
step_pin = 17
dir_pin = 27
ms_pins = [5, 6, 13]
syringe = "BD5mL"
step_type = "Half"
step_delay = 0.0005
pitch = 0.08
fill_valve_pin = 22

[modules.A]
pump = "pumpA"
valve_pin = 23
lick_pin = 24
led_pin = 20
speaker = "left"
dead_volume = 1.0
post_delay = 0.0
"#
    );
    let cfg = reward_config::load_toml(&text).unwrap();
    let board = Arc::new(SimBoard::new());
    let ctrl = Controller::from_config(
        &cfg,
        board.clone(),
        Arc::new(TestClock::new()),
        ControllerOptions::default(),
    )
    .unwrap();
    let pump = ctrl.pump("pumpA").unwrap();
    pump.set_position(Holder::new(), pump.syringe().max_pos())
        .unwrap();
    (board, ctrl)
}

fn reply(ctrl: &Controller, frame: &str) -> Reply {
    match handle_frame(ctrl, frame) {
        Action::Reply(r) => r,
        Action::Shutdown => panic!("unexpected shutdown for {frame}"),
    }
}

#[rstest]
#[case(r#"{"command":"trigger_reward","module":"A","amount":0.2,"sync":true}"#, Reply::Success)]
#[case(r#"{"command":"trigger_reward","module":"A","amount":50,"sync":true}"#, Reply::Error)]
#[case(r#"{"command":"trigger_reward","module":"Z","amount":0.2}"#, Reply::Error)]
#[case(r#"{"command":"trigger_reward","module":"A"}"#, Reply::Error)]
#[case(r#"{"command":"toggle_valve","name":"A","open":true}"#, Reply::Value(json!(true)))]
#[case(r#"{"command":"toggle_LED","name":"A.led"}"#, Reply::Value(json!(true)))]
#[case(r#"{"command":"toggle_led","name":"A.led","on":false}"#, Reply::Value(json!(false)))]
#[case(r#"{"command":"toggle_auto_fill","on":true}"#, Reply::Value(json!(true)))]
#[case(r#"{"command":"set_auto_fill_frac_thresh","value":1.5}"#, Reply::Error)]
#[case(r#"{"command":"update_post_delay","module":"A","post_delay":0.1}"#, Reply::Success)]
#[case(r#"{"command":"set_microstep_type","pump":"pumpA","step_type":"1/8"}"#, Reply::Success)]
#[case(r#"{"command":"set_microstep_type","pump":"pumpA","step_type":"1/3"}"#, Reply::Error)]
#[case(r#"{"command":"change_syringe","pump":"pumpA","syringe":"BD10mL"}"#, Reply::Success)]
#[case(r#"{"command":"play_tone","speakers":["A"],"freq":30000,"dur":0.1}"#, Reply::Error)]
#[case(r#"{"command":"play_tone","speakers":["left"],"freq":6000,"dur":0.1}"#, Reply::Success)]
#[case(r#"{"command":"play","speakers":["A"],"signal":[0.0,0.5,-0.5],"fs":8000}"#, Reply::Success)]
#[case(r#"{"command":"play","signal":[]}"#, Reply::Error)]
#[case(r#"{"command":"play_tone","freq":1000,"dur":1e16}"#, Reply::Error)]
#[case(r#"{"command":"reset_licks","module":"A"}"#, Reply::Success)]
#[case(r#"{"command":"reset_all_licks"}"#, Reply::Success)]
#[case(r#"{"command":"stop_recording"}"#, Reply::Success)]
#[case(r#"{"command":"GET","req":"pumps.nope"}"#, Reply::Error)]
#[case(r#"{"command":"GET","req":"auto_fill"}"#, Reply::Value(json!(false)))]
#[case(r#"{"command":"fly_to_moon"}"#, Reply::Error)]
#[case("garbage", Reply::Error)]
fn frames_map_to_replies(#[case] frame: &str, #[case] expected: Reply) {
    let dir = tempfile::tempdir().unwrap();
    let (_board, ctrl) = controller(&dir);
    assert_eq!(reply(&ctrl, frame), expected, "{frame}");
}

#[test]
fn set_flow_rate_returns_the_step_delay() {
    let dir = tempfile::tempdir().unwrap();
    let (_board, ctrl) = controller(&dir);
    let Reply::Value(v) = reply(
        &ctrl,
        r#"{"command":"set_flow_rate","pump":"pumpA","flow_rate":1.0}"#,
    ) else {
        panic!("expected a value");
    };
    let delay = v.as_f64().unwrap();
    let stored = ctrl.get("pumps.pumpA.step_delay").unwrap();
    assert_eq!(stored.as_f64().unwrap(), delay);
}

#[test]
fn record_replies_with_the_event_file() {
    let dir = tempfile::tempdir().unwrap();
    let (_board, ctrl) = controller(&dir);
    let Reply::Value(Value::String(path)) = reply(&ctrl, r#"{"command":"record"}"#) else {
        panic!("expected a path");
    };
    assert!(std::path::Path::new(&path).starts_with(dir.path().join("data")));
    assert_eq!(ctrl.get("recording").unwrap(), json!(true));
}

#[test]
fn kill_requests_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let (_board, ctrl) = controller(&dir);
    assert_eq!(handle_frame(&ctrl, r#"{"command":"KILL"}"#), Action::Shutdown);
}

fn send(stream: &mut TcpStream, reader: &mut BufReader<TcpStream>, frame: &str) -> String {
    stream.write_all(frame.as_bytes()).unwrap();
    stream.write_all(b"\n").unwrap();
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    line
}

#[test]
fn tcp_session_until_kill() {
    let dir = tempfile::tempdir().unwrap();
    let (board, ctrl) = controller(&dir);
    let ctrl = Arc::new(ctrl);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let server = Server::new(ctrl.clone(), listener).unwrap();
    let addr = server.local_addr().unwrap();
    let runner = thread::spawn(move || server.run());

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut reader = BufReader::new(stream.try_clone().unwrap());

    let before = ctrl.get("pumps.pumpA.vol_left").unwrap().as_f64().unwrap();
    assert_eq!(
        send(
            &mut stream,
            &mut reader,
            r#"{"command":"trigger_reward","module":"A","amount":0.5,"sync":true}"#
        ),
        "SUCCESS\n"
    );
    let after: f64 = send(&mut stream, &mut reader, r#"{"command":"GET","req":"pumps.pumpA.vol_left"}"#)
        .trim()
        .parse()
        .unwrap();
    assert!((before - after - 0.5).abs() < 0.01, "{before} -> {after}");
    assert!(board.line(23).rising_writes() >= 1);
    assert_eq!(send(&mut stream, &mut reader, r#"{"command":"nope"}"#), "ERROR\n");

    let status: Value =
        serde_json::from_str(&send(&mut stream, &mut reader, r#"{"command":"status"}"#)).unwrap();
    assert!(status["pumps"]["pumpA"].is_object());
    assert!(status["modules"]["A"].is_object());

    assert_eq!(send(&mut stream, &mut reader, "KILL"), "SUCCESS\n");
    runner.join().unwrap();
}

#[test]
fn overlong_line_is_refused_and_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let (_board, ctrl) = controller(&dir);
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let server = Server::new(Arc::new(ctrl), listener).unwrap();
    let addr = server.local_addr().unwrap();
    let runner = thread::spawn(move || server.run());

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut junk = vec![b'x'; 2 * MAX_FRAME + 10];
    junk.push(b'\n');
    stream.write_all(&junk).unwrap();

    let mut reply = String::new();
    reader.read_line(&mut reply).unwrap();
    assert_eq!(reply, "ERROR\n");

    // The rest of the long line is dropped; the next frame is served.
    assert_eq!(
        send(&mut stream, &mut reader, r#"{"command":"GET","req":"pumps.pumpA.syringe"}"#),
        "\"BD5mL\"\n"
    );
    assert_eq!(send(&mut stream, &mut reader, "KILL"), "SUCCESS\n");
    runner.join().unwrap();
}
