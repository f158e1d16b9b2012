//! KWP2000 / GMLAN negative response codes

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegativeResponseCode {
    GeneralReject,
    ServiceNotSupported,
    SubFunctionNotSupportedOrInvalidFormat,
    BusyRepeatRequest,
    ConditionsNotCorrectOrRequestSequenceError,
    RoutineNotCompleteOrServiceInProgress,
    RequestOutOfRange,
    SecurityAccessDenied,
    InvalidKey,
    ExceededNumberOfAttempts,
    RequiredTimeDelayNotExpired,
    DownloadNotAccepted,
    ImproperDownloadType,
    CannotDownloadToSpecifiedAddress,
    CannotDownloadNumberOfBytesRequested,
    UploadNotAccepted,
    ImproperUploadType,
    CannotUploadFromSpecifiedAddress,
    CannotUploadNumberOfBytesRequested,
    TransferSuspended,
    TransferAborted,
    IllegalAddressInBlockTransfer,
    IllegalByteCountInBlockTransfer,
    IllegalBlockTransferType,
    BlockTransferDataChecksumError,
    ResponsePending,
    IncorrectByteCountDuringBlockTransfer,
    ServiceNotSupportedInActiveSession,
    Unknown(u8),
}

/// (code, variant, description)
const TABLE: [(u8, NegativeResponseCode, &str); 28] = {
    use NegativeResponseCode::*;
    [
        (0x10, GeneralReject, "General reject"),
        (0x11, ServiceNotSupported, "Service not supported"),
        (0x12, SubFunctionNotSupportedOrInvalidFormat, "Sub-function not supported or invalid format"),
        (0x21, BusyRepeatRequest, "Busy, repeat request"),
        (0x22, ConditionsNotCorrectOrRequestSequenceError, "Conditions not correct or request sequence error"),
        (0x23, RoutineNotCompleteOrServiceInProgress, "Routine not completed or service in progress"),
        (0x31, RequestOutOfRange, "Request out of range or session dropped"),
        (0x33, SecurityAccessDenied, "Security access denied"),
        (0x35, InvalidKey, "Invalid key supplied"),
        (0x36, ExceededNumberOfAttempts, "Exceeded number of attempts to get security access"),
        (0x37, RequiredTimeDelayNotExpired, "Required time delay not expired"),
        (0x40, DownloadNotAccepted, "Download not accepted"),
        (0x41, ImproperDownloadType, "Improper download type"),
        (0x42, CannotDownloadToSpecifiedAddress, "Unable to download to specified address"),
        (0x43, CannotDownloadNumberOfBytesRequested, "Unable to download number of bytes requested"),
        (0x50, UploadNotAccepted, "Upload not accepted"),
        (0x51, ImproperUploadType, "Improper upload type"),
        (0x52, CannotUploadFromSpecifiedAddress, "Unable to upload from specified address"),
        (0x53, CannotUploadNumberOfBytesRequested, "Unable to upload number of bytes requested"),
        (0x71, TransferSuspended, "Transfer suspended"),
        (0x72, TransferAborted, "Transfer aborted"),
        (0x74, IllegalAddressInBlockTransfer, "Illegal address in block transfer"),
        (0x75, IllegalByteCountInBlockTransfer, "Illegal byte count in block transfer"),
        (0x76, IllegalBlockTransferType, "Illegal block transfer type"),
        (0x77, BlockTransferDataChecksumError, "Block transfer data checksum error"),
        (0x78, ResponsePending, "Response pending"),
        (0x79, IncorrectByteCountDuringBlockTransfer, "Incorrect byte count during block transfer"),
        (0x80, ServiceNotSupportedInActiveSession, "Service not supported in current diagnostics session"),
    ]
};

impl NegativeResponseCode {
    pub fn description(&self) -> &'static str {
        TABLE
            .iter()
            .find(|(_, nrc, _)| nrc == self)
            .map_or("Unknown error", |(_, _, desc)| desc)
    }

    pub fn is_response_pending(&self) -> bool {
        *self == NegativeResponseCode::ResponsePending
    }
}

impl From<u8> for NegativeResponseCode {
    fn from(value: u8) -> Self {
        TABLE
            .iter()
            .find(|(code, _, _)| *code == value)
            .map_or(NegativeResponseCode::Unknown(value), |(_, nrc, _)| *nrc)
    }
}

impl From<NegativeResponseCode> for u8 {
    fn from(nrc: NegativeResponseCode) -> Self {
        match nrc {
            NegativeResponseCode::Unknown(v) => v,
            known => TABLE
                .iter()
                .find(|(_, n, _)| *n == known)
                .map_or(0, |(code, _, _)| *code),
        }
    }
}

impl fmt::Display for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.description(), u8::from(*self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_table_code_round_trips() {
        for (code, nrc, _) in TABLE.iter() {
            assert_eq!(NegativeResponseCode::from(*code), *nrc);
            assert_eq!(u8::from(*nrc), *code);
        }
    }

    #[test]
    fn test_unknown_code() {
        let nrc = NegativeResponseCode::from(0x99);
        assert_eq!(nrc, NegativeResponseCode::Unknown(0x99));
        assert_eq!(nrc.to_string(), "Unknown error (0x99)");
        assert!(NegativeResponseCode::from(0x78).is_response_pending());
    }
}
