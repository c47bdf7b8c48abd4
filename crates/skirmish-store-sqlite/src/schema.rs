//! SQL schema for the skirmish SQLite store.
//!
//! Executed once at connection startup. `PRAGMA user_version` records the
//! layout so later migrations can be gated on it.

/// Full schema DDL; idempotent thanks to `IF NOT EXISTS`.
///
/// Timestamps are fixed-width RFC 3339 UTC strings, so text comparison is
/// chronological and the range predicates can use the indexes.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- Killmails are written by ingestion and only ever read by detection.
CREATE TABLE IF NOT EXISTS killmails (
    killmail_id   INTEGER PRIMARY KEY,
    killmail_time TEXT    NOT NULL,
    location_id   INTEGER NOT NULL,
    total_value   REAL    NOT NULL DEFAULT 0,
    is_npc        INTEGER NOT NULL DEFAULT 0,
    is_solo       INTEGER NOT NULL DEFAULT 0,
    body          TEXT    NOT NULL    -- full killmail as JSON
);

CREATE INDEX IF NOT EXISTS killmails_time_idx          ON killmails(killmail_time);
CREATE INDEX IF NOT EXISTS killmails_location_time_idx ON killmails(location_id, killmail_time);

CREATE TABLE IF NOT EXISTS battles (
    battle_id  TEXT    PRIMARY KEY,
    start_time TEXT    NOT NULL,
    end_time   TEXT    NOT NULL,
    custom     INTEGER NOT NULL DEFAULT 0,
    document   TEXT    NOT NULL,     -- full battle as JSON
    CHECK (start_time < end_time)
);

-- One row per system a battle covers; drives the overlap lookup.
CREATE TABLE IF NOT EXISTS battle_systems (
    battle_id   TEXT    NOT NULL REFERENCES battles(battle_id) ON DELETE CASCADE,
    location_id INTEGER NOT NULL,
    PRIMARY KEY (battle_id, location_id)
);

CREATE INDEX IF NOT EXISTS battle_systems_location_idx ON battle_systems(location_id);
CREATE INDEX IF NOT EXISTS battles_start_idx           ON battles(start_time);

CREATE TABLE IF NOT EXISTS systems (
    location_id INTEGER PRIMARY KEY,
    name        TEXT,
    security    REAL,
    region_id   INTEGER,
    region      TEXT
);

CREATE TABLE IF NOT EXISTS item_types (
    type_id INTEGER PRIMARY KEY,
    name    TEXT NOT NULL
);

PRAGMA user_version = 1;
";
