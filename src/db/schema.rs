//! Database schema and migrations for filevault.
//!
//! Migrations are applied sequentially when the database is first opened or
//! upgraded; the schema_version table tracks which ones have run.

/// Database migrations.
pub const MIGRATIONS: &[&str] = &[
    // v1: accounts and the file/directory tree
    r#"
CREATE TABLE accounts (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL UNIQUE,
    used_space  INTEGER NOT NULL DEFAULT 0,
    quota       INTEGER NOT NULL,
    root_id     INTEGER,                 -- root directory node
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE nodes (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id        INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
    parent_id       INTEGER REFERENCES nodes(id),
    name            TEXT NOT NULL,
    mime_type       TEXT NOT NULL DEFAULT '',
    size            INTEGER NOT NULL DEFAULT 0,
    is_directory    INTEGER NOT NULL DEFAULT 0,
    status          TEXT NOT NULL DEFAULT 'completed',  -- 'incomplete', 'completed'
    backing_object  TEXT,                               -- chunk store handle
    chunk_size      INTEGER NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at      TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE UNIQUE INDEX idx_nodes_parent_name ON nodes(parent_id, name);
CREATE INDEX idx_nodes_owner_id ON nodes(owner_id);
CREATE INDEX idx_nodes_backing_object ON nodes(backing_object);
"#,
    // v2: resumable upload sessions
    r#"
CREATE TABLE upload_sessions (
    node_id     INTEGER PRIMARY KEY REFERENCES nodes(id) ON DELETE CASCADE,
    file_size   INTEGER NOT NULL,
    chunk_size  INTEGER NOT NULL,        -- fits in 32 bits
    bitmap      BLOB NOT NULL,           -- 1 = pending, 0 = written
    created_at  TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at  TEXT NOT NULL DEFAULT (datetime('now'))
);
"#,
    // v3: share grants
    r#"
CREATE TABLE shares (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    node_id     INTEGER NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
    grantor_id  INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
    grantee_id  INTEGER NOT NULL REFERENCES accounts(id) ON DELETE CASCADE,
    access_mode TEXT NOT NULL,           -- 'read_only', 'read_write', 'full_access'
    expires_at  TEXT NOT NULL,
    created_at  TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(node_id, grantee_id)
);

CREATE INDEX idx_shares_grantee_id ON shares(grantee_id);
"#,
];
