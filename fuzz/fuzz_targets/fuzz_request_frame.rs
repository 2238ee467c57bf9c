#![no_main]
use libfuzzer_sys::fuzz_target;
use reward_cli::client::to_frame;
use reward_cli::protocol::parse_request;

// Both the server-side frame parser and the shell-line encoder must
// reject bad input with an error, never a panic.
fuzz_target!(|data: &str| {
    let _ = parse_request(data);
    if let Ok(Some(frame)) = to_frame(data) {
        let _ = parse_request(&frame);
    }
});
