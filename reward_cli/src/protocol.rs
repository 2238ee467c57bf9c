//! Newline-delimited JSON request frames and their mapping onto
//! [`Controller`] methods.
//!
//! A frame is `{"command": "<name>", <keyword arguments>}`. Replies are the
//! literal `SUCCESS`, the literal `ERROR`, or the JSON return value of the
//! command, each terminated by `\n`. `KILL` stops the server and `GET`
//! reads a dotted path of the status snapshot.

use std::path::PathBuf;

use reward_core::{Controller, RewardError, RewardOptions};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

pub const SUCCESS: &str = "SUCCESS";
pub const ERROR: &str = "ERROR";

type Result<T> = std::result::Result<T, RewardError>;

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Kill,
    Get { req: String },
    Call { command: String, args: Map<String, Value> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Success,
    Error,
    Value(Value),
}

impl Reply {
    /// Wire form, including the trailing newline.
    pub fn to_line(&self) -> String {
        match self {
            Reply::Success => format!("{SUCCESS}\n"),
            Reply::Error => format!("{ERROR}\n"),
            Reply::Value(v) => format!("{v}\n"),
        }
    }
}

/// What the connection should do after handling one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Reply(Reply),
    /// Acknowledge with `SUCCESS`, then stop the server.
    Shutdown,
}

pub fn parse_request(frame: &str) -> Result<Request> {
    let frame = frame.trim();
    if frame == "KILL" {
        return Ok(Request::Kill);
    }
    let value: Value = serde_json::from_str(frame)
        .map_err(|e| RewardError::InvalidArgument(format!("malformed frame: {e}")))?;
    let Value::Object(mut args) = value else {
        return Err(RewardError::InvalidArgument(
            "frame must be a JSON object".into(),
        ));
    };
    let command = match args.remove("command") {
        Some(Value::String(c)) => c,
        Some(other) => {
            return Err(RewardError::InvalidArgument(format!(
                "'command' must be a string, got {other}"
            )));
        }
        None => return Err(RewardError::InvalidArgument("missing 'command'".into())),
    };
    match command.as_str() {
        "KILL" => Ok(Request::Kill),
        "GET" => match args.remove("req") {
            Some(Value::String(req)) => Ok(Request::Get { req }),
            None => Ok(Request::Get { req: String::new() }),
            Some(other) => Err(RewardError::InvalidArgument(format!(
                "GET 'req' must be a string, got {other}"
            ))),
        },
        _ => Ok(Request::Call { command, args }),
    }
}

/// Parse and run one frame. Failures are logged and answered with `ERROR`.
pub fn handle_frame(ctrl: &Controller, frame: &str) -> Action {
    let request = match parse_request(frame) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "rejected frame");
            return Action::Reply(Reply::Error);
        }
    };
    let (command, result) = match request {
        Request::Kill => return Action::Shutdown,
        Request::Get { req } => ("GET".to_string(), ctrl.get(&req).map(Some)),
        Request::Call { command, args } => {
            let result = dispatch(ctrl, &command, args);
            (command, result)
        }
    };
    match result {
        Ok(None) => Action::Reply(Reply::Success),
        Ok(Some(v)) => Action::Reply(Reply::Value(v)),
        Err(e) => {
            tracing::warn!(%command, kind = e.kind(), error = %e, "command failed");
            Action::Reply(Reply::Error)
        }
    }
}

fn decode<T: DeserializeOwned>(command: &str, args: Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(args))
        .map_err(|e| RewardError::InvalidArgument(format!("{command}: {e}")))
}

fn yes() -> bool {
    true
}

fn unit_volume() -> f64 {
    1.0
}

fn default_prime_amount() -> f64 {
    1.0
}

fn default_res_amount() -> f64 {
    5.0
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct NoArgs {}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TriggerReward {
    module: String,
    amount: f64,
    #[serde(default)]
    force: bool,
    #[serde(default)]
    sync: bool,
    #[serde(default)]
    enqueue: bool,
    #[serde(default)]
    triggered: bool,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct FillLines {
    #[serde(default)]
    modules: Option<Vec<String>>,
    #[serde(default = "default_prime_amount")]
    prime_amount: f64,
    #[serde(default = "default_res_amount")]
    res_amount: f64,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct EmptyLines {
    #[serde(default)]
    modules: Option<Vec<String>>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PumpArg {
    pump: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RefillSyringe {
    pump: String,
    #[serde(default)]
    sync: bool,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PushToReservoir {
    pump: String,
    #[serde(default)]
    amount: Option<f64>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ToggleValve {
    name: String,
    #[serde(default)]
    open: Option<bool>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ToggleLed {
    name: String,
    #[serde(default)]
    on: Option<bool>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PlayTone {
    #[serde(default, alias = "modules")]
    speakers: Vec<String>,
    freq: f64,
    dur: f64,
    #[serde(default = "unit_volume")]
    volume: f64,
    #[serde(default = "yes")]
    force: bool,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Play {
    #[serde(default, alias = "modules")]
    speakers: Vec<String>,
    signal: Vec<f32>,
    #[serde(default)]
    fs: Option<u32>,
    #[serde(default = "yes")]
    force: bool,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ResetLicks {
    #[serde(alias = "name")]
    module: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ChangeSyringe {
    pump: String,
    syringe: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SetMicrostep {
    pump: String,
    #[serde(alias = "microstep_type")]
    step_type: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SetStepSpeed {
    pump: String,
    step_delay: f64,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SetFlowRate {
    pump: String,
    flow_rate: f64,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct UpdatePostDelay {
    module: String,
    post_delay: f64,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ToggleAutoFill {
    #[serde(default)]
    on: Option<bool>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct FracThresh {
    #[serde(alias = "thresh")]
    value: f64,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Record {
    #[serde(default = "yes")]
    reset: bool,
    #[serde(default)]
    data_dir: Option<PathBuf>,
}

/// Run `command` with keyword `args`. `Ok(None)` means a unit result.
pub fn dispatch(
    ctrl: &Controller,
    command: &str,
    args: Map<String, Value>,
) -> Result<Option<Value>> {
    match command {
        "trigger_reward" => {
            let a: TriggerReward = decode(command, args)?;
            let opts = RewardOptions {
                force: a.force,
                sync: a.sync,
                enqueue: a.enqueue,
                triggered: a.triggered,
            };
            ctrl.trigger_reward(&a.module, a.amount, opts)?;
            Ok(None)
        }
        "fill_lines" => {
            let a: FillLines = decode(command, args)?;
            ctrl.fill_lines(a.modules.as_deref(), a.prime_amount, a.res_amount)?;
            Ok(None)
        }
        "empty_lines" => {
            let a: EmptyLines = decode(command, args)?;
            ctrl.empty_lines(a.modules.as_deref())?;
            Ok(None)
        }
        "refill_syringe" => {
            let a: RefillSyringe = decode(command, args)?;
            ctrl.refill_syringe(&a.pump, a.sync)?;
            Ok(None)
        }
        "push_to_reservoir" => {
            let a: PushToReservoir = decode(command, args)?;
            ctrl.push_to_reservoir(&a.pump, a.amount)?;
            Ok(None)
        }
        "calibrate" => {
            let a: PumpArg = decode(command, args)?;
            ctrl.calibrate(&a.pump)?;
            Ok(None)
        }
        "stop_pump" => {
            let a: PumpArg = decode(command, args)?;
            ctrl.stop_pump(&a.pump)?;
            Ok(None)
        }
        "toggle_valve" => {
            let a: ToggleValve = decode(command, args)?;
            Ok(Some(Value::Bool(ctrl.toggle_valve(&a.name, a.open)?)))
        }
        "toggle_led" | "toggle_LED" => {
            let a: ToggleLed = decode(command, args)?;
            Ok(Some(Value::Bool(ctrl.toggle_led(&a.name, a.on)?)))
        }
        "play_tone" => {
            let a: PlayTone = decode(command, args)?;
            ctrl.play_tone(&a.speakers, a.freq, a.dur, a.volume, a.force)?;
            Ok(None)
        }
        "play" => {
            let a: Play = decode(command, args)?;
            ctrl.play(&a.speakers, &a.signal, a.fs, a.force)?;
            Ok(None)
        }
        "stop_audio" => {
            let _: NoArgs = decode(command, args)?;
            ctrl.stop_audio()?;
            Ok(None)
        }
        "reset_licks" => {
            let a: ResetLicks = decode(command, args)?;
            ctrl.reset_licks(&a.module)?;
            Ok(None)
        }
        "reset_all_licks" => {
            let _: NoArgs = decode(command, args)?;
            ctrl.reset_all_licks();
            Ok(None)
        }
        "change_syringe" => {
            let a: ChangeSyringe = decode(command, args)?;
            ctrl.change_syringe(&a.pump, &a.syringe)?;
            Ok(None)
        }
        "set_microstep_type" => {
            let a: SetMicrostep = decode(command, args)?;
            ctrl.set_microstep_type(&a.pump, &a.step_type)?;
            Ok(None)
        }
        "set_step_speed" => {
            let a: SetStepSpeed = decode(command, args)?;
            ctrl.set_step_speed(&a.pump, a.step_delay)?;
            Ok(None)
        }
        "set_flow_rate" => {
            let a: SetFlowRate = decode(command, args)?;
            let step_delay = ctrl.set_flow_rate(&a.pump, a.flow_rate)?;
            Ok(Some(Value::from(step_delay)))
        }
        "update_post_delay" => {
            let a: UpdatePostDelay = decode(command, args)?;
            ctrl.update_post_delay(&a.module, a.post_delay)?;
            Ok(None)
        }
        "toggle_auto_fill" => {
            let a: ToggleAutoFill = decode(command, args)?;
            Ok(Some(Value::Bool(ctrl.toggle_auto_fill(a.on))))
        }
        "set_auto_fill_frac_thresh" => {
            let a: FracThresh = decode(command, args)?;
            ctrl.set_auto_fill_frac_thresh(a.value)?;
            Ok(None)
        }
        "record" => {
            let a: Record = decode(command, args)?;
            let file = ctrl.record(a.reset, a.data_dir.as_deref())?;
            Ok(Some(Value::String(file.display().to_string())))
        }
        "stop_recording" => {
            let _: NoArgs = decode(command, args)?;
            ctrl.stop_recording();
            Ok(None)
        }
        "status" => {
            let _: NoArgs = decode(command, args)?;
            Ok(Some(ctrl.status()))
        }
        other => Err(RewardError::InvalidArgument(format!(
            "unknown command '{other}'"
        ))),
    }
}
