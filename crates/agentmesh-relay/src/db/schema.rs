//! Initial schema

/// Schema version 1: the full relay state model.
///
/// `contacts` stores one row per unordered pair with `agent_a < agent_b`;
/// the CHECK constraint makes a reversed or duplicate pair unrepresentable.
pub const SCHEMA_V1: &str = "
CREATE TABLE agents (
    name            TEXT PRIMARY KEY,
    public_key      TEXT NOT NULL,
    owner_email     TEXT NOT NULL,
    endpoint        TEXT,
    email_verified  INTEGER NOT NULL DEFAULT 0,
    status          TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'active', 'revoked')),
    last_seen       INTEGER,
    created_at      INTEGER NOT NULL,
    approved_by     TEXT,
    approved_at     INTEGER,
    key_updated_at  INTEGER,
    pending_key     TEXT,
    pending_key_effective_at INTEGER
);

CREATE TABLE contacts (
    agent_a      TEXT NOT NULL REFERENCES agents(name),
    agent_b      TEXT NOT NULL REFERENCES agents(name),
    status       TEXT NOT NULL CHECK (status IN ('pending', 'active')),
    requested_by TEXT NOT NULL,
    greeting     TEXT,
    created_at   INTEGER NOT NULL,
    updated_at   INTEGER NOT NULL,
    PRIMARY KEY (agent_a, agent_b),
    CHECK (agent_a < agent_b)
);

CREATE TABLE email_verifications (
    agent_name  TEXT PRIMARY KEY,
    email       TEXT NOT NULL,
    code_hash   TEXT NOT NULL,
    attempts    INTEGER NOT NULL DEFAULT 0,
    expires_at  INTEGER NOT NULL,
    verified    INTEGER NOT NULL DEFAULT 0,
    created_at  INTEGER NOT NULL
);

CREATE TABLE admins (
    agent            TEXT PRIMARY KEY,
    admin_public_key TEXT NOT NULL,
    added_at         INTEGER NOT NULL
);

CREATE TABLE broadcasts (
    id         TEXT PRIMARY KEY,
    type       TEXT NOT NULL,
    payload    TEXT NOT NULL,
    sender     TEXT NOT NULL,
    signature  TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE rate_limits (
    bucket       TEXT NOT NULL,
    window_start INTEGER NOT NULL,
    count        INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (bucket, window_start)
);

CREATE TABLE groups (
    group_id           TEXT PRIMARY KEY,
    name               TEXT NOT NULL,
    owner              TEXT NOT NULL REFERENCES agents(name),
    status             TEXT NOT NULL DEFAULT 'active'
                       CHECK (status IN ('active', 'dissolved')),
    members_can_invite INTEGER NOT NULL DEFAULT 0,
    members_can_send   INTEGER NOT NULL DEFAULT 1,
    max_members        INTEGER NOT NULL DEFAULT 50 CHECK (max_members <= 50),
    created_at         INTEGER NOT NULL
);

CREATE TABLE group_members (
    group_id  TEXT NOT NULL REFERENCES groups(group_id),
    agent     TEXT NOT NULL REFERENCES agents(name),
    role      TEXT NOT NULL CHECK (role IN ('owner', 'admin', 'member')),
    joined_at INTEGER NOT NULL,
    PRIMARY KEY (group_id, agent)
);

CREATE TABLE group_invitations (
    group_id   TEXT NOT NULL REFERENCES groups(group_id),
    invitee    TEXT NOT NULL REFERENCES agents(name),
    invited_by TEXT NOT NULL,
    greeting   TEXT,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (group_id, invitee)
);

CREATE TABLE group_changes (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    group_id TEXT NOT NULL,
    change   TEXT NOT NULL,
    agent    TEXT,
    at       INTEGER NOT NULL
);

CREATE INDEX idx_contacts_b ON contacts(agent_b);
CREATE INDEX idx_group_changes_feed ON group_changes(group_id, at);
CREATE INDEX idx_broadcasts_created ON broadcasts(created_at);
";
