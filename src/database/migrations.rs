//! Database migrations for member-sync
//!
//! This module contains SQL migrations for the SQLite database schema.

/// SQL statement to create the initial database schema
pub const CREATE_SCHEMA: &str = r#"
-- Group update jobs table
CREATE TABLE IF NOT EXISTS group_update_jobs (
    id TEXT PRIMARY KEY,
    request_id TEXT NOT NULL,
    user_id INTEGER NOT NULL,
    group_id INTEGER NOT NULL,
    status TEXT NOT NULL
        CHECK (status IN ('PENDING', 'RUNNING', 'CANCELLED', 'SUCCEEDED', 'FAILED')),
    info TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_jobs_status_user ON group_update_jobs(status, user_id, created_at);
CREATE INDEX IF NOT EXISTS idx_jobs_request ON group_update_jobs(request_id);

-- Group members table
CREATE TABLE IF NOT EXISTS group_members (
    group_id INTEGER NOT NULL,
    user_id INTEGER NOT NULL CHECK (user_id > 0),
    UNIQUE(group_id, user_id)
);

-- Groups table
CREATE TABLE IF NOT EXISTS groups (
    id INTEGER PRIMARY KEY,
    last_updated_at TEXT
);

-- OAuth access tokens table
CREATE TABLE IF NOT EXISTS oauth_tokens (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    access_token TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tokens_user ON oauth_tokens(user_id, created_at DESC);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_create_schema_valid_sql() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(CREATE_SCHEMA).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(Result::ok)
            .collect();

        assert!(tables.contains(&"group_update_jobs".to_string()));
        assert!(tables.contains(&"group_members".to_string()));
        assert!(tables.contains(&"groups".to_string()));
        assert!(tables.contains(&"oauth_tokens".to_string()));
    }

    #[test]
    fn test_schema_is_rerunnable() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(CREATE_SCHEMA).unwrap();
        conn.execute_batch(CREATE_SCHEMA).unwrap();
    }

    #[test]
    fn test_group_members_unique_constraint() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(CREATE_SCHEMA).unwrap();

        conn.execute(
            "INSERT INTO group_members (group_id, user_id) VALUES (?1, ?2)",
            [42, 1],
        )
        .unwrap();

        let result = conn.execute(
            "INSERT INTO group_members (group_id, user_id) VALUES (?1, ?2)",
            [42, 1],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_group_members_rejects_non_positive_ids() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(CREATE_SCHEMA).unwrap();

        let result = conn.execute(
            "INSERT INTO group_members (group_id, user_id) VALUES (?1, ?2)",
            [42, -5],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_job_status_check_constraint() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(CREATE_SCHEMA).unwrap();

        let result = conn.execute(
            r#"
            INSERT INTO group_update_jobs
            (id, request_id, user_id, group_id, status, info, created_at, updated_at)
            VALUES ('a', 'b', 1, 2, 'PAUSED', '{}', 'now', 'now')
            "#,
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_migration_version() {
        assert_eq!(migration_version(), 1);
    }
}
