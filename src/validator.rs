//! Pre-execution query validation (C1).
//!
//! Blocks dangerous patterns before a query ever reaches a backend
//! connection. Pattern tables and rejection categories mirror the reference
//! sandbox's validator; nothing here opens a connection or executes a query.

use crate::types::BackendKind;
use once_cell::sync::Lazy;
use regex::Regex;

/// Closed category set a `Blocked` diagnostic belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    FileRead,
    FileWrite,
    SystemCmd,
    Privilege,
    ServerConfig,
    Destructive,
    InfoLeak,
    Extension,
    Network,
    Auth,
    Replication,
    Admin,
}

impl Category {
    fn message(self) -> &'static str {
        match self {
            Category::FileRead => "Nice try! Reading server files is not allowed in the sandbox.",
            Category::FileWrite => "Writing to server files is not allowed in the sandbox.",
            Category::SystemCmd => "Executing system or program commands is not allowed in the sandbox.",
            Category::Privilege => "Creating or modifying roles, users, or privileges is not allowed in the sandbox.",
            Category::ServerConfig => "Changing server configuration is not allowed in the sandbox.",
            Category::Destructive => "This destructive operation is not allowed in the sandbox.",
            Category::InfoLeak => "Inspecting server internals is not allowed in the sandbox.",
            Category::Extension => "Installing extensions or creating functions/procedures is not allowed in the sandbox.",
            Category::Network => "Cross-server or network operations are not allowed in the sandbox.",
            Category::Auth => "Authentication bypass attempts are not allowed in the sandbox.",
            Category::Replication => "Inspecting replication status is not allowed in the sandbox.",
            Category::Admin => "Administrative operations are not allowed in the sandbox.",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Blocked {
    pub category: Category,
    pub message: String,
}

impl Blocked {
    fn new(category: Category) -> Self {
        Self {
            category,
            message: category.message().to_string(),
        }
    }

    fn with_message(category: Category, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Blocked {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// First-match-wins ordered pattern table shared by the three SQL dialects.
static SQL_RULES: Lazy<Vec<(Regex, Category)>> = Lazy::new(|| {
    let rules: &[(&str, Category)] = &[
        (r"(?i)\bpg_read_file\b", Category::FileRead),
        (r"(?i)\bpg_read_binary_file\b", Category::FileRead),
        (r"(?i)\blo_import\b", Category::FileRead),
        (r"(?i)\bload_file\s*\(", Category::FileRead),
        (r"(?i)\bpg_write_file\b", Category::FileWrite),
        (r"(?i)\blo_export\b", Category::FileWrite),
        (r"(?i)\binto\s+outfile\b", Category::FileWrite),
        (r"(?i)\binto\s+dumpfile\b", Category::FileWrite),
        (r"(?i)\bcopy\b[\s\S]*\b(from|to)\s+program\b", Category::SystemCmd),
        (r"(?i)\bxp_cmdshell\b", Category::SystemCmd),
        (r"(?i)\bsys_exec\b|\bsys_eval\b", Category::SystemCmd),
        (r"(?i)\bpg_(shadow|authid|roles)\b", Category::InfoLeak),
        (r"(?i)\bmysql\.(user|db|proc)\b", Category::InfoLeak),
        (r"(?i)\bpg_terminate_backend\b|\bpg_cancel_backend\b", Category::Destructive),
        (r"(?i)\bpg_sleep\s*\(", Category::Destructive),
        (r"(?i)\bsleep\s*\(", Category::Destructive),
        (r"(?i)\bbenchmark\s*\(", Category::Destructive),
        (r"(?i)\bset\s+global\b", Category::ServerConfig),
        (r"(?i)\balter\s+system\b", Category::ServerConfig),
        (r"(?i)\bcreate\s+role\b", Category::Privilege),
        (r"(?i)\bcreate\s+user\b", Category::Privilege),
        (r"(?i)\balter\s+role\b", Category::Privilege),
        (r"(?i)\balter\s+user\b", Category::Privilege),
        (r"(?i)\bdrop\s+role\b", Category::Privilege),
        (r"(?i)\bdrop\s+user\b", Category::Privilege),
        (r"(?i)\bgrant\b", Category::Privilege),
        (r"(?i)\brevoke\b", Category::Privilege),
        (r"(?i)\bcreate\s+extension\b", Category::Extension),
        (r"(?i)\bcreate\s+(or\s+replace\s+)?function\b", Category::Extension),
        (r"(?i)\bcreate\s+procedure\b", Category::Extension),
        (r"(?i)\bcreate\s+trigger\b", Category::Extension),
        (r"(?i)\bcreate\s+event\b", Category::Extension),
        (r"(?i)\bdo\s*\$\$", Category::Extension),
        (r"(?i)\bcreate\s+schema\b", Category::Privilege),
        (r"(?i)\bdrop\s+schema\b", Category::Destructive),
        (r"(?i)\bset\s+search_path\b", Category::Privilege),
        (r"(?i)\buse\s+\w+", Category::Privilege),
        (r"(?i)\bcreate\s+database\b", Category::Privilege),
        (r"(?i)\bdrop\s+database\b", Category::Destructive),
        (r"(?i)\bdblink\b", Category::Network),
        (r"(?i)\bpostgres_fdw\b", Category::Network),
        (r"(?i)\bcreate\s+(server|foreign\s+data\s+wrapper)\b", Category::Network),
        (r"(?i)\bshow\s+variables\b", Category::InfoLeak),
        (r"(?i)\bshow\s+grants\b", Category::InfoLeak),
        (r"(?i)\bshow\s+(master|slave)\s+status\b", Category::Replication),
        (r"(?i)\bpg_stat_replication\b", Category::Replication),
    ];
    rules
        .iter()
        .map(|(pattern, category)| (Regex::new(pattern).expect("static pattern compiles"), *category))
        .collect()
});

static MONGO_RULES: Lazy<Vec<(Regex, Category)>> = Lazy::new(|| {
    let rules: &[(&str, Category)] = &[
        (r"(?i)\badmincommand\b", Category::Admin),
        (r"(?i)\bruncommand\b", Category::Admin),
        (r"(?i)\bgetsiblingdb\b", Category::Admin),
        (r"(?i)\$where\b", Category::SystemCmd),
        (r"(?i)\$function\b", Category::SystemCmd),
        (r"(?i)\bmapreduce\b", Category::SystemCmd),
        (r"(?i)\bcreateuser\b", Category::Privilege),
        (r"(?i)\bdropuser\b", Category::Privilege),
        (r"(?i)\bcreaterole\b", Category::Privilege),
        (r"(?i)\bdropdatabase\b", Category::Destructive),
        (r"(?i)\bserverstatus\b", Category::InfoLeak),
        (r"(?i)\bhostinfo\b", Category::InfoLeak),
        (r"(?i)\blistdatabases\b", Category::InfoLeak),
        (r"(?i)\breplsetgetstatus\b", Category::Replication),
        (r"(?i)\bismaster\b", Category::Replication),
        (r"(?i)\bprocess\.", Category::SystemCmd),
        (r"(?i)\brequire\s*\(", Category::SystemCmd),
        (r"(?i)\bchild_process\b", Category::SystemCmd),
        (r"(?i)\bspawn\s*\(", Category::SystemCmd),
        (r"(?i)\bexec\s*\(", Category::SystemCmd),
    ];
    rules
        .iter()
        .map(|(pattern, category)| (Regex::new(pattern).expect("static pattern compiles"), *category))
        .collect()
});

static REDIS_ALLOWED: Lazy<std::collections::HashSet<&'static str>> = Lazy::new(|| {
    [
        "GET", "SET", "SETNX", "SETEX", "PSETEX", "GETSET", "GETDEL", "APPEND", "STRLEN",
        "INCR", "DECR", "INCRBY", "DECRBY", "INCRBYFLOAT", "MGET", "MSET", "MSETNX",
        "DEL", "UNLINK", "EXISTS", "EXPIRE", "PEXPIRE", "EXPIREAT", "TTL", "PTTL",
        "PERSIST", "TYPE", "KEYS", "SCAN", "RENAME", "RENAMENX", "COPY",
        "HGET", "HSET", "HSETNX", "HMGET", "HMSET", "HGETALL", "HDEL", "HEXISTS",
        "HKEYS", "HVALS", "HLEN", "HINCRBY", "HINCRBYFLOAT", "HSCAN",
        "LPUSH", "RPUSH", "LPOP", "RPOP", "LRANGE", "LLEN", "LINDEX", "LSET",
        "LREM", "LTRIM", "LINSERT", "RPOPLPUSH", "LMOVE",
        "SADD", "SREM", "SMEMBERS", "SISMEMBER", "SCARD", "SDIFF", "SINTER",
        "SUNION", "SDIFFSTORE", "SINTERSTORE", "SUNIONSTORE", "SMOVE", "SSCAN", "SPOP",
        "SRANDMEMBER",
        "ZADD", "ZREM", "ZRANGE", "ZREVRANGE", "ZRANGEBYSCORE", "ZSCORE", "ZCARD",
        "ZCOUNT", "ZINCRBY", "ZRANK", "ZREVRANK", "ZSCAN",
        "PFADD", "PFCOUNT", "PFMERGE",
        "XADD", "XLEN", "XRANGE", "XREVRANGE", "XREAD", "XDEL",
        "SUBSCRIBE", "UNSUBSCRIBE", "PUBLISH",
        "GEOADD", "GEODIST", "GEOPOS", "GEOSEARCH",
        "PING", "ECHO", "MULTI", "EXEC", "DISCARD", "WATCH", "UNWATCH", "DBSIZE",
    ]
    .into_iter()
    .collect()
});

/// Strip block (`/* ... */`) and line (`-- ...`) SQL comments, then collapse
/// runs of whitespace to single spaces.
fn strip_sql_comments(input: &str) -> String {
    static BLOCK_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)/\*.*?\*/").unwrap());
    static LINE_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"--[^\n]*").unwrap());
    static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

    let no_block = BLOCK_COMMENT.replace_all(input, " ");
    let no_line = LINE_COMMENT.replace_all(&no_block, " ");
    WHITESPACE.replace_all(no_line.trim(), " ").into_owned()
}

fn validate_sql(query_text: &str) -> Result<(), Blocked> {
    let cleaned = strip_sql_comments(query_text);
    for (pattern, category) in SQL_RULES.iter() {
        if pattern.is_match(&cleaned) {
            return Err(Blocked::new(*category));
        }
    }
    Ok(())
}

fn validate_mongodb(query_text: &str) -> Result<(), Blocked> {
    for (pattern, category) in MONGO_RULES.iter() {
        if pattern.is_match(query_text) {
            return Err(Blocked::new(*category));
        }
    }
    Ok(())
}

fn redis_dangerous_message(command: &str) -> Category {
    match command {
        "CONFIG" => Category::ServerConfig,
        "FLUSHALL" | "FLUSHDB" | "SHUTDOWN" => Category::Destructive,
        "SLAVEOF" | "REPLICAOF" => Category::Replication,
        "SCRIPT" | "EVAL" | "EVALSHA" | "FUNCTION" => Category::SystemCmd,
        "ACL" => Category::Privilege,
        "MIGRATE" | "CLUSTER" => Category::Network,
        "DEBUG" => Category::InfoLeak,
        "MODULE" => Category::Extension,
        "SWAPDB" | "SELECT" => Category::Admin,
        "MONITOR" => Category::InfoLeak,
        _ => Category::Admin,
    }
}

fn validate_redis(query_text: &str) -> Result<(), Blocked> {
    let tokens = shell_words::split(query_text)
        .unwrap_or_else(|_| query_text.split_whitespace().map(str::to_string).collect());
    let Some(raw_command) = tokens.first() else {
        return Ok(());
    };
    let command = raw_command.to_uppercase();
    if REDIS_ALLOWED.contains(command.as_str()) {
        return Ok(());
    }
    let category = redis_dangerous_message(&command);
    Err(Blocked::with_message(
        category,
        format!("The command '{command}' is not available in the sandbox."),
    ))
}

/// Validates `query_text` for `backend_kind`. Never opens a connection.
pub fn validate(backend_kind: BackendKind, query_text: &str) -> Result<(), Blocked> {
    match backend_kind {
        BackendKind::Sqlite | BackendKind::PostgreSql | BackendKind::MariaDb => {
            validate_sql(query_text)
        }
        BackendKind::MongoDb => validate_mongodb(query_text),
        BackendKind::Redis => validate_redis(query_text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_file_read() {
        let err = validate(BackendKind::PostgreSql, "SELECT pg_read_file('/etc/passwd')")
            .unwrap_err();
        assert_eq!(err.category, Category::FileRead);
        assert_eq!(
            err.message,
            "Nice try! Reading server files is not allowed in the sandbox."
        );
    }

    #[test]
    fn blocks_grant() {
        let err = validate(BackendKind::MariaDb, "GRANT ALL ON *.* TO 'x'@'%'").unwrap_err();
        assert_eq!(err.category, Category::Privilege);
    }

    #[test]
    fn strips_comments_before_matching() {
        let err = validate(
            BackendKind::PostgreSql,
            "SELECT /* sneaky */ pg_read_file(-- trailing\n'/etc/passwd')",
        )
        .unwrap_err();
        assert_eq!(err.category, Category::FileRead);
    }

    #[test]
    fn allows_benign_select() {
        assert!(validate(BackendKind::PostgreSql, "SELECT * FROM students").is_ok());
    }

    #[test]
    fn mongo_blocks_admin_command() {
        let err = validate(BackendKind::MongoDb, "db.adminCommand({shutdown: 1})").unwrap_err();
        assert_eq!(err.category, Category::Admin);
    }

    #[test]
    fn mongo_allows_find() {
        assert!(validate(BackendKind::MongoDb, "db.users.find({})").is_ok());
    }

    #[test]
    fn redis_whitelists_data_commands() {
        assert!(validate(BackendKind::Redis, "SET k 1").is_ok());
        assert!(validate(BackendKind::Redis, "GET k").is_ok());
    }

    #[test]
    fn redis_blocks_flushall_with_specific_message() {
        let err = validate(BackendKind::Redis, "FLUSHALL").unwrap_err();
        assert_eq!(err.category, Category::Destructive);
    }

    #[test]
    fn redis_blocks_unknown_command_generically() {
        let err = validate(BackendKind::Redis, "SOMETHINGWEIRD arg").unwrap_err();
        assert_eq!(err.category, Category::Admin);
    }
}
