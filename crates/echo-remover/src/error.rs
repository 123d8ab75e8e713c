/// Errors returned when an echo remover cannot be constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The sample rate is not one of 16, 32 or 48 kHz.
    BadSampleRate,
    /// A render or capture channel count of zero.
    BadNumberChannels,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadSampleRate => write!(f, "bad sample rate"),
            Self::BadNumberChannels => write!(f, "bad number of channels"),
        }
    }
}

impl std::error::Error for Error {}
