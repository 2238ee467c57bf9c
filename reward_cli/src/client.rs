//! Line-oriented client: each input line becomes one request frame and the
//! server's one-line reply is printed.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;

use eyre::{WrapErr, eyre};
use serde_json::{Map, Value};

/// Turn a shell line into a JSON frame. Blank lines and `#` comments yield
/// `None`.
///
/// Accepted forms: a raw JSON object, `KILL`, or
/// `command key=value ...` where each value is parsed as JSON and falls
/// back to a plain string.
pub fn to_frame(line: &str) -> eyre::Result<Option<String>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    if line.starts_with('{') {
        let v: Value = serde_json::from_str(line).wrap_err("invalid JSON frame")?;
        return Ok(Some(v.to_string()));
    }
    let mut tokens = line.split_whitespace();
    let Some(command) = tokens.next() else {
        return Ok(None);
    };
    let mut frame = Map::new();
    frame.insert("command".into(), Value::String(command.to_string()));
    for tok in tokens {
        let (key, raw) = tok
            .split_once('=')
            .ok_or_else(|| eyre!("expected key=value, got '{tok}'"))?;
        if key.is_empty() {
            eyre::bail!("empty key in '{tok}'");
        }
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        frame.insert(key.to_string(), value);
    }
    Ok(Some(Value::Object(frame).to_string()))
}

fn is_kill(frame: &str) -> bool {
    serde_json::from_str::<Value>(frame)
        .ok()
        .and_then(|v| v.get("command").and_then(Value::as_str).map(|c| c == "KILL"))
        .unwrap_or(false)
}

struct Session {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl Session {
    /// Send one line and print the reply. `Ok(false)` ends the session.
    fn relay<W: Write>(&mut self, line: &str, out: &mut W) -> eyre::Result<bool> {
        if matches!(line.trim(), "quit" | "exit") {
            return Ok(false);
        }
        let frame = match to_frame(line) {
            Ok(Some(f)) => f,
            Ok(None) => return Ok(true),
            Err(e) => {
                writeln!(out, "invalid input: {e:#}")?;
                return Ok(true);
            }
        };
        self.writer.write_all(frame.as_bytes())?;
        self.writer.write_all(b"\n")?;

        let mut reply = String::new();
        if self.reader.read_line(&mut reply)? == 0 {
            eyre::bail!("server closed the connection");
        }
        writeln!(out, "{}", reply.trim_end())?;
        out.flush()?;
        Ok(!is_kill(&frame))
    }
}

/// Connect and relay `exec` lines, or every line of `input` when `exec` is
/// empty. Stops after `quit`/`exit`, after `KILL`, or at end of input.
pub fn run<R: BufRead, W: Write>(
    host: &str,
    port: u16,
    exec: &[String],
    input: R,
    mut out: W,
) -> eyre::Result<()> {
    let stream =
        TcpStream::connect((host, port)).wrap_err_with(|| format!("connect {host}:{port}"))?;
    let mut session = Session {
        reader: BufReader::new(stream.try_clone()?),
        writer: stream,
    };
    tracing::debug!(%host, port, "connected");

    if exec.is_empty() {
        for line in input.lines() {
            if !session.relay(&line?, &mut out)? {
                break;
            }
        }
    } else {
        for line in exec {
            if !session.relay(line, &mut out)? {
                break;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn frame(line: &str) -> Value {
        serde_json::from_str(&to_frame(line).unwrap().unwrap()).unwrap()
    }

    #[test]
    fn key_values_parse_as_json_or_string() {
        assert_eq!(
            frame("trigger_reward module=A amount=0.1 enqueue=true"),
            json!({"command": "trigger_reward", "module": "A", "amount": 0.1, "enqueue": true})
        );
        assert_eq!(
            frame(r#"fill_lines modules=["A","B"] prime_amount=2"#),
            json!({"command": "fill_lines", "modules": ["A", "B"], "prime_amount": 2})
        );
    }

    #[test]
    fn raw_json_passes_through() {
        assert_eq!(
            frame(r#"  {"command": "GET", "req": "auto_fill"} "#),
            json!({"command": "GET", "req": "auto_fill"})
        );
    }

    #[test]
    fn kill_is_recognised() {
        let f = to_frame("KILL").unwrap().unwrap();
        assert!(is_kill(&f));
        assert!(!is_kill(&to_frame("status").unwrap().unwrap()));
    }

    #[rstest]
    #[case("")]
    #[case("   ")]
    #[case("# comment")]
    fn nothing_to_send(#[case] line: &str) {
        assert!(to_frame(line).unwrap().is_none());
    }

    #[rstest]
    #[case("toggle_valve A")]
    #[case("toggle_valve =A")]
    #[case("{not json")]
    fn bad_lines_are_rejected(#[case] line: &str) {
        assert!(to_frame(line).is_err());
    }
}
