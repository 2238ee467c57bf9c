use thiserror::Error;

#[derive(Debug, Error)]
pub enum HwError {
    #[error("gpio error: {0}")]
    Gpio(String),
    #[error("i2c error: {0}")]
    I2c(String),
    #[error("audio error: {0}")]
    Audio(String),
    #[error("line {0} is already claimed")]
    Busy(u8),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HwError>;
