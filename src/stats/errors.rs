//! Error message classification.

pub const USER_INTERRUPTION: &str = "User Interruption";
pub const FILE_NOT_FOUND: &str = "File Not Found";
pub const FILE_NOT_READ: &str = "File Not Read";
pub const CONTENT_NOT_FOUND: &str = "Content Not Found";
pub const PERMISSION_DENIED: &str = "Permission Denied";
pub const COMMAND_FAILED: &str = "Command Failed";
pub const TIMEOUT: &str = "Timeout";
pub const SYNTAX_ERROR: &str = "Syntax Error";
pub const API_ERROR: &str = "API Error";
pub const OTHER: &str = "Other";

/// Classify an error message into one of the fixed categories.
///
/// Checks run in order, so a message matching several patterns lands in the
/// first listed category.
pub fn categorize(message: &str) -> &'static str {
    let lower = message.to_lowercase();

    if lower.contains("interrupted by user")
        || lower.contains("doesn't want to proceed")
        || lower.contains("user rejected")
    {
        return USER_INTERRUPTION;
    }

    if lower.contains("file has not been read yet") || lower.contains("read it first") {
        return FILE_NOT_READ;
    }

    if lower.contains("file does not exist")
        || lower.contains("no such file")
        || lower.contains("file not found")
        || lower.contains("enoent")
    {
        return FILE_NOT_FOUND;
    }

    if lower.contains("string to replace not found")
        || lower.contains("no matches found")
        || lower.contains("content not found")
    {
        return CONTENT_NOT_FOUND;
    }

    if lower.contains("permission denied")
        || lower.contains("operation not permitted")
        || lower.contains("eacces")
    {
        return PERMISSION_DENIED;
    }

    if lower.contains("timed out") || lower.contains("timeout") || lower.contains("etimedout") {
        return TIMEOUT;
    }

    if lower.contains("syntax error")
        || lower.contains("syntaxerror")
        || lower.contains("unexpected token")
        || lower.contains("parse error")
    {
        return SYNTAX_ERROR;
    }

    if lower.contains("api error")
        || lower.contains("api_error")
        || lower.contains("rate limit")
        || lower.contains("overloaded")
        || lower.contains("invalid_request_error")
    {
        return API_ERROR;
    }

    if lower.contains("command failed")
        || lower.contains("exit code")
        || lower.contains("command not found")
        || lower.contains("non-zero")
    {
        return COMMAND_FAILED;
    }

    OTHER
}
