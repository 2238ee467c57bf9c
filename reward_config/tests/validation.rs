use reward_config::{PluginKind, load_file, load_toml};
use rstest::rstest;

const BASE: &str = r#"
state_dir = "state"

[pumps.pumpA]
step_pin = 17
dir_pin = 27
ms_pins = [5, 6, 13]
fill_valve_pin = 21
flush_pin = 2
reverse_pin = 3

[speakers.left]
sd_pin = 12
channel = 0

[modules.A]
pump = "pumpA"
valve_pin = 22
lick_pin = 4
led_pin = 23
speaker = "left"
dead_volume = 1.0
post_delay = 0.5

[modules.B]
pump = "pumpA"
valve_pin = 24
"#;

#[test]
fn accepts_minimal_two_module_config() {
    let cfg = load_toml(BASE).expect("parse TOML");
    cfg.validate().expect("valid config should pass");
    let pump = &cfg.pumps["pumpA"];
    assert_eq!(pump.syringe, "BD5mL");
    assert_eq!(pump.step_type, "Half");
    assert!(pump.fill_valve_nc);
    assert_eq!(cfg.modules["B"].reward_thresh, 3);
    assert_eq!(cfg.server.port, 8123);
}

#[rstest]
#[case("[modules.C]\npump = \"nope\"\nvalve_pin = 25\n", "does not name a configured pump")]
#[case("[modules.C]\npump = \"pumpA\"\nvalve_pin = 22\n", "already used")]
#[case("[modules.C]\npump = \"pumpA\"\nvalve_pin = 25\nspeaker = \"right\"\n", "configured speaker")]
#[case("[modules.C]\npump = \"pumpA\"\nvalve_pin = 25\nlick_bus_pin = 3\n", "requires a [lick_bus]")]
#[case("[modules.C]\npump = \"pumpA\"\nvalve_pin = 25\nsettle_ms = 5\n", "settle_ms must be in [20, 50]")]
#[case("[controller]\nauto_fill_frac_thresh = 1.0\n", "auto_fill_frac_thresh")]
#[case("[plugins.A]\nkind = \"led\"\npin = 26\n", "collides with a module")]
#[case("[logging]\nrotation = \"weekly\"\n", "logging.rotation")]
fn rejects_inconsistent_tables(#[case] extra: &str, #[case] needle: &str) {
    let text = format!("{BASE}\n{extra}");
    let cfg = load_toml(&text).expect("parse TOML");
    let err = cfg.validate().expect_err("should reject");
    let msg = format!("{err}");
    assert!(msg.contains(needle), "unexpected message: {msg}");
}

#[rstest]
#[case("syringe = \"BD7mL\"", "syringe")]
#[case("step_type = \"1/3\"", "step_type")]
#[case("step_delay = 0.0", "step_delay")]
#[case("pitch = -1.0", "pitch")]
fn rejects_bad_pump_parameters(#[case] line: &str, #[case] needle: &str) {
    let text = format!(
        "[pumps.p]\nstep_pin = 1\ndir_pin = 2\nms_pins = [3, 4, 5]\n{line}\n"
    );
    let cfg = load_toml(&text).expect("parse TOML");
    let err = cfg.validate().expect_err("should reject");
    assert!(format!("{err}").contains(needle));
}

#[test]
fn requires_at_least_one_pump() {
    let err = load_toml("pumps = {}\n")
        .expect("parse TOML")
        .validate()
        .expect_err("no pumps");
    assert!(format!("{err}").contains("at least one"));
}

#[test]
fn parses_plugins_and_lick_bus() {
    let text = format!(
        "{BASE}\n[lick_bus]\ninterrupt_pin = 16\n\n[modules.C]\npump = \"pumpA\"\nvalve_pin = 25\nlick_bus_pin = 0\n\n[plugins.cue]\nkind = \"led\"\npin = 26\n"
    );
    let cfg = load_toml(&text).expect("parse TOML");
    cfg.validate().expect("valid");
    assert_eq!(cfg.plugins["cue"].kind, PluginKind::Led);
    let bus = cfg.lick_bus.as_ref().expect("bus");
    assert_eq!(bus.address, 0x20);
    assert_eq!(bus.i2c_bus, 1);
}

#[test]
fn load_file_reports_path_on_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "pumps = [").unwrap();
    let err = load_file(&path).expect_err("parse error");
    assert!(format!("{err}").contains("bad.toml"));
}
