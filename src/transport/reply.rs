//! 服务器返回码

/// 返回码 >= 300 视为失败
pub const FAILURE_THRESHOLD: u32 = 300;

pub const FILE_STATUS_OK: u32 = 150;
pub const COMMAND_OK: u32 = 200;
pub const SERVICE_READY: u32 = 220;
pub const CLOSING_DATA_CONNECTION: u32 = 226;
pub const USER_LOGGED_IN: u32 = 230;
pub const FILE_ACTION_OK: u32 = 250;
pub const NOT_LOGGED_IN: u32 = 530;
pub const FILE_UNAVAILABLE: u32 = 550;
pub const COMMAND_NOT_IMPLEMENTED_FOR_PARAMETER: u32 = 504;
pub const SERVICE_NOT_AVAILABLE: u32 = 421;

pub fn is_failure(code: u32) -> bool {
    code >= FAILURE_THRESHOLD
}

/// 把数字返回码翻译成可读名称
pub fn reply_code_name(code: u32) -> &'static str {
    match code {
        110 => "RESTART_MARKER",
        120 => "SERVICE_NOT_READY",
        125 => "DATA_CONNECTION_ALREADY_OPEN",
        150 => "FILE_STATUS_OK",
        200 => "COMMAND_OK",
        202 => "COMMAND_IS_SUPERFLUOUS",
        211 => "SYSTEM_STATUS",
        212 => "DIRECTORY_STATUS",
        213 => "FILE_STATUS",
        214 => "HELP_MESSAGE",
        215 => "NAME_SYSTEM_TYPE",
        220 => "SERVICE_READY",
        221 => "SERVICE_CLOSING_CONTROL_CONNECTION",
        225 => "DATA_CONNECTION_OPEN",
        226 => "CLOSING_DATA_CONNECTION",
        227 => "ENTERING_PASSIVE_MODE",
        229 => "ENTERING_EPSV_MODE",
        230 => "USER_LOGGED_IN",
        234 => "SECURITY_DATA_EXCHANGE_COMPLETE",
        250 => "FILE_ACTION_OK",
        257 => "PATHNAME_CREATED",
        331 => "NEED_PASSWORD",
        332 => "NEED_ACCOUNT",
        350 => "FILE_ACTION_PENDING",
        421 => "SERVICE_NOT_AVAILABLE",
        425 => "CANNOT_OPEN_DATA_CONNECTION",
        426 => "TRANSFER_ABORTED",
        450 => "FILE_ACTION_NOT_TAKEN",
        451 => "ACTION_ABORTED",
        452 => "INSUFFICIENT_STORAGE",
        500 => "UNRECOGNIZED_COMMAND",
        501 => "SYNTAX_ERROR_IN_ARGUMENTS",
        502 => "COMMAND_NOT_IMPLEMENTED",
        503 => "BAD_COMMAND_SEQUENCE",
        504 => "COMMAND_NOT_IMPLEMENTED_FOR_PARAMETER",
        530 => "NOT_LOGGED_IN",
        532 => "NEED_ACCOUNT_FOR_STORING_FILES",
        550 => "FILE_UNAVAILABLE",
        551 => "PAGE_TYPE_UNKNOWN",
        552 => "STORAGE_ALLOCATION_EXCEEDED",
        553 => "FILE_NAME_NOT_ALLOWED",
        _ => "UNKNOWN_REPLY",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_code_name() {
        assert_eq!(reply_code_name(530), "NOT_LOGGED_IN");
        assert_eq!(reply_code_name(550), "FILE_UNAVAILABLE");
        assert_eq!(reply_code_name(999), "UNKNOWN_REPLY");
    }

    #[test]
    fn test_failure_threshold() {
        assert!(!is_failure(USER_LOGGED_IN));
        assert!(!is_failure(299));
        assert!(is_failure(300));
        assert!(is_failure(NOT_LOGGED_IN));
    }
}
