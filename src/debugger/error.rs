use crate::debugger::register::Register;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- session state errors --------------------------------------
    #[error("debugee already running")]
    Busy,
    #[error("session is stopped, program must be reloaded")]
    SessionTerminated,

    // --------------------------------- validation errors -----------------------------------------
    #[error("address {address:#X} with width {width} is out of memory range (memory size {memory_len})")]
    OutOfRange {
        address: u64,
        width: u64,
        memory_len: u64,
    },
    #[error("instruction is too large ({size} > {available} bytes)")]
    TooLarge { size: u64, available: u64 },
    #[error("a label with name \"{0}\" is not defined")]
    UnknownLabel(String),
    #[error("label reference at offset {offset} does not fit into {len} assembled bytes")]
    LabelOffset { offset: usize, len: usize },
    #[error("assembly error: {0:#}")]
    Assemble(anyhow::Error),

    // --------------------------------- runtime errors --------------------------------------------
    #[error("processor fault: {0:#}")]
    ProcessorFault(anyhow::Error),
    #[error("the {register} register does not contain a valid memory address ({value:#X})")]
    InvalidFrameRegister { register: Register, value: u64 },
    #[error("execution thread disconnected without completion")]
    RunnerDisconnected,

    // --------------------------------- third party errors ----------------------------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error("config parsing error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

impl Error {
    /// Return a hint to an interface - continue debugging after error or tear down the session
    /// and require a program reload.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Busy => false,
            Error::SessionTerminated => false,
            Error::OutOfRange { .. } => false,
            Error::TooLarge { .. } => false,
            Error::UnknownLabel(_) => false,
            Error::LabelOffset { .. } => false,
            Error::Assemble(_) => false,
            Error::IO(_) => false,
            Error::ConfigParse(_) => false,

            // processor state is not trusted after these
            Error::ProcessorFault(_) => true,
            Error::InvalidFrameRegister { .. } => true,
            Error::RunnerDisconnected => true,
        }
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
