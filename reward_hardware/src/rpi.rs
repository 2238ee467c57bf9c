//! Raspberry Pi board: rppal GPIO lines, an MCP23017 expander on rppal I2C,
//! and an `aplay` child process as the PCM sink.
use std::io::Write;
use std::process::{Child, Command, Stdio};

use parking_lot::Mutex;
use rppal::gpio::{Gpio, InputPin, Level, OutputPin, Trigger};
use rppal::i2c::I2c;
use reward_traits::{
    AudioOutput, Board, DigitalInput, DigitalOutput, Edge, EdgeCallback, HwResult, PortExpander,
    Pull,
};
use tracing::{debug, trace, warn};

use crate::error::{HwError, Result};
use crate::util::route_to_channel;

pub struct RpiBoard {
    gpio: Gpio,
}

impl RpiBoard {
    pub fn new() -> Result<Self> {
        let gpio = Gpio::new().map_err(|e| HwError::Gpio(e.to_string()))?;
        Ok(Self { gpio })
    }
}

impl Board for RpiBoard {
    fn output(&self, pin: u8) -> HwResult<Box<dyn DigitalOutput>> {
        let pin = self
            .gpio
            .get(pin)
            .map_err(|e| HwError::Gpio(format!("open output {pin}: {e}")))?
            .into_output_low();
        Ok(Box::new(RpiOutput { pin }))
    }

    fn input(&self, pin: u8, pull: Pull) -> HwResult<Box<dyn DigitalInput>> {
        let raw = self
            .gpio
            .get(pin)
            .map_err(|e| HwError::Gpio(format!("open input {pin}: {e}")))?;
        let pin = match pull {
            Pull::None => raw.into_input(),
            Pull::Up => raw.into_input_pullup(),
            Pull::Down => raw.into_input_pulldown(),
        };
        Ok(Box::new(RpiInput { pin }))
    }

    fn expander(&self, bus: u8, address: u16) -> HwResult<Box<dyn PortExpander>> {
        Ok(Box::new(Mcp23017::open(bus, address)?))
    }

    fn audio(&self, device: Option<&str>) -> HwResult<Box<dyn AudioOutput>> {
        Ok(Box::new(AplayOutput {
            device: device.map(str::to_owned),
            child: Mutex::new(None),
        }))
    }
}

struct RpiOutput {
    pin: OutputPin,
}

impl DigitalOutput for RpiOutput {
    fn set_level(&mut self, high: bool) -> HwResult<()> {
        self.pin.write(if high { Level::High } else { Level::Low });
        Ok(())
    }

    fn level(&self) -> bool {
        self.pin.is_set_high()
    }
}

struct RpiInput {
    pin: InputPin,
}

impl DigitalInput for RpiInput {
    fn is_high(&self) -> HwResult<bool> {
        Ok(self.pin.is_high())
    }

    fn subscribe(&mut self, edge: Edge, mut callback: EdgeCallback) -> HwResult<()> {
        let trigger = match edge {
            Edge::Rising => Trigger::RisingEdge,
            Edge::Falling => Trigger::FallingEdge,
            Edge::Both => Trigger::Both,
        };
        self.pin
            .set_async_interrupt(trigger, move |level: Level| callback(level == Level::High))
            .map_err(|e| HwError::Gpio(format!("interrupt on {}: {e}", self.pin.pin())))?;
        Ok(())
    }
}

// MCP23017 register map with IOCON.BANK = 0.
const IODIRA: u8 = 0x00;
const IODIRB: u8 = 0x01;
const GPINTENA: u8 = 0x04;
const GPINTENB: u8 = 0x05;
const INTCONA: u8 = 0x08;
const INTCONB: u8 = 0x09;
const IOCON: u8 = 0x0A;
const INTFA: u8 = 0x0E;
const INTFB: u8 = 0x0F;
const INTCAPA: u8 = 0x10;
const INTCAPB: u8 = 0x11;
const GPIOA: u8 = 0x12;
const GPIOB: u8 = 0x13;
/// INTA and INTB internally OR'ed onto one line.
const IOCON_MIRROR: u8 = 0x40;

pub struct Mcp23017 {
    i2c: I2c,
}

impl Mcp23017 {
    pub fn open(bus: u8, address: u16) -> Result<Self> {
        let mut i2c = I2c::with_bus(bus).map_err(|e| HwError::I2c(format!("bus {bus}: {e}")))?;
        i2c.set_slave_address(address)
            .map_err(|e| HwError::I2c(format!("address {address:#04x}: {e}")))?;
        Ok(Self { i2c })
    }

    fn write(&mut self, reg: u8, value: u8) -> Result<()> {
        self.i2c
            .smbus_write_byte(reg, value)
            .map_err(|e| HwError::I2c(format!("write {reg:#04x}: {e}")))
    }

    fn read(&mut self, reg: u8) -> Result<u8> {
        self.i2c
            .smbus_read_byte(reg)
            .map_err(|e| HwError::I2c(format!("read {reg:#04x}: {e}")))
    }

    fn read_pair(&mut self, a: u8, b: u8) -> Result<u16> {
        let lo = self.read(a)?;
        let hi = self.read(b)?;
        Ok(u16::from(lo) | (u16::from(hi) << 8))
    }
}

impl PortExpander for Mcp23017 {
    fn configure_inputs(&mut self) -> HwResult<()> {
        self.write(IOCON, IOCON_MIRROR)?;
        self.write(IODIRA, 0xFF)?;
        self.write(IODIRB, 0xFF)?;
        // Compare against previous value: interrupt on any change.
        self.write(INTCONA, 0x00)?;
        self.write(INTCONB, 0x00)?;
        self.write(GPINTENA, 0xFF)?;
        self.write(GPINTENB, 0xFF)?;
        let stale = self.read_pair(INTCAPA, INTCAPB)?;
        debug!(stale, "mcp23017 configured");
        Ok(())
    }

    fn interrupt_flags(&mut self) -> HwResult<u16> {
        Ok(self.read_pair(INTFA, INTFB)?)
    }

    fn captured_levels(&mut self) -> HwResult<u16> {
        let v = self.read_pair(INTCAPA, INTCAPB)?;
        trace!(captured = v, "mcp23017 capture");
        Ok(v)
    }

    fn levels(&mut self) -> HwResult<u16> {
        Ok(self.read_pair(GPIOA, GPIOB)?)
    }
}

/// Streams stereo S16_LE frames to `aplay`; the mono signal is routed to the
/// requested channel.
pub struct AplayOutput {
    device: Option<String>,
    child: Mutex<Option<Child>>,
}

impl AudioOutput for AplayOutput {
    fn play(&mut self, channel: u8, samples: &[i16], fs: u32) -> HwResult<()> {
        self.stop()?;
        let mut cmd = Command::new("aplay");
        cmd.args(["-q", "-t", "raw", "-f", "S16_LE", "-c", "2", "-r"])
            .arg(fs.to_string());
        if let Some(dev) = &self.device {
            cmd.arg("-D").arg(dev);
        }
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| HwError::Audio(format!("spawn aplay: {e}")))?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| HwError::Audio("aplay stdin unavailable".into()))?;
        let bytes: Vec<u8> = route_to_channel(samples, channel)
            .into_iter()
            .flat_map(i16::to_le_bytes)
            .collect();
        // The pipe drains at playback speed; feed it off-thread.
        std::thread::spawn(move || {
            if let Err(e) = stdin.write_all(&bytes) {
                trace!(error = %e, "aplay pipe closed early");
            }
        });
        *self.child.lock() = Some(child);
        Ok(())
    }

    fn stop(&mut self) -> HwResult<()> {
        if let Some(mut child) = self.child.lock().take() {
            if let Ok(None) = child.try_wait() {
                if let Err(e) = child.kill() {
                    warn!(error = %e, "failed to stop aplay");
                }
            }
            let _ = child.wait();
        }
        Ok(())
    }

    fn is_busy(&self) -> bool {
        self.child
            .lock()
            .as_mut()
            .is_some_and(|c| matches!(c.try_wait(), Ok(None)))
    }
}

impl Drop for AplayOutput {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
