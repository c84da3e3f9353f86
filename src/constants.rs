//! Shared file-name conventions used across the application.

/// Success log file name, stored in the input directory.
pub const SUCCESS_LOG_FILE: &str = "download_success.log";

/// Prefix of every per-collection error log file name.
pub const ERROR_LOG_PREFIX: &str = "[error log] ";

/// Suffix marking a terminal private entry in an error log.
pub const PRIVATE_SUFFIX: &str = " (private)";

/// Separator between collection name and URL in scoped success records.
pub const SCOPE_SEPARATOR: &str = ":::";

/// Raw export of uncategorized favorites. Never processed directly.
pub const UNCATEGORIZED_EXPORT_FILE: &str = "Favorite Videos (URLs).txt";

/// Name prefix of uncategorized collection files. These log unscoped.
pub const UNCATEGORIZED_NAME: &str = "All Uncategorized Favorites";

/// Run summary written to the input directory at the end of a run.
pub const SUMMARY_FILE: &str = "summary.json";

/// Extension of collection source files.
pub const COLLECTION_EXTENSION: &str = "txt";
