use rusqlite::{Connection, Result};

/// Placeholder replaced by the configured table prefix in every statement.
pub(crate) const PREFIX_TOKEN: &str = "{prefix}";

/// Substitute the table prefix into an SQL template.
pub(crate) fn rtp(template: &str, prefix: &str) -> String {
    template.replace(PREFIX_TOKEN, prefix)
}

/// Initialise the job-store schema under `prefix`. Safe to call on every
/// startup (idempotent).
///
/// Every table is keyed by `SCHED_NAME` so several logical schedulers can
/// share one database file. Times are epoch milliseconds.
pub fn init_db(conn: &Connection, prefix: &str) -> Result<()> {
    create_job_details_table(conn, prefix)?;
    create_triggers_table(conn, prefix)?;
    create_calendars_table(conn, prefix)?;
    create_paused_groups_table(conn, prefix)?;
    create_fired_triggers_table(conn, prefix)?;
    create_scheduler_state_table(conn, prefix)?;
    create_locks_table(conn, prefix)?;
    Ok(())
}

fn create_job_details_table(conn: &Connection, prefix: &str) -> Result<()> {
    conn.execute_batch(&rtp(
        "CREATE TABLE IF NOT EXISTS {prefix}JOB_DETAILS (
            SCHED_NAME          TEXT    NOT NULL,
            JOB_NAME            TEXT    NOT NULL,
            JOB_GROUP           TEXT    NOT NULL,
            DESCRIPTION         TEXT,
            JOB_CLASS_NAME      TEXT    NOT NULL,
            IS_DURABLE          INTEGER NOT NULL,
            IS_NONCONCURRENT    INTEGER NOT NULL,
            IS_UPDATE_DATA      INTEGER NOT NULL,
            REQUESTS_RECOVERY   INTEGER NOT NULL,
            JOB_DATA            TEXT    NOT NULL,   -- JSON object
            PRIMARY KEY (SCHED_NAME, JOB_NAME, JOB_GROUP)
        ) STRICT;",
        prefix,
    ))
}

fn create_triggers_table(conn: &Connection, prefix: &str) -> Result<()> {
    conn.execute_batch(&rtp(
        "CREATE TABLE IF NOT EXISTS {prefix}TRIGGERS (
            SCHED_NAME          TEXT    NOT NULL,
            TRIGGER_NAME        TEXT    NOT NULL,
            TRIGGER_GROUP       TEXT    NOT NULL,
            JOB_NAME            TEXT    NOT NULL,
            JOB_GROUP           TEXT    NOT NULL,
            DESCRIPTION         TEXT,
            NEXT_FIRE_TIME      INTEGER,
            PREV_FIRE_TIME      INTEGER,
            PRIORITY            INTEGER NOT NULL,
            TRIGGER_STATE       TEXT    NOT NULL,
            TRIGGER_TYPE        TEXT    NOT NULL,   -- schedule registry discriminator
            START_TIME          INTEGER NOT NULL,
            END_TIME            INTEGER,
            CALENDAR_NAME       TEXT,
            MISFIRE_INSTR       INTEGER NOT NULL,   -- -1 = ignore misfire policy
            JOB_DATA            TEXT    NOT NULL,
            SCHEDULE_PROPS      TEXT    NOT NULL,   -- per-type properties, JSON
            PRIMARY KEY (SCHED_NAME, TRIGGER_NAME, TRIGGER_GROUP)
        ) STRICT;

        -- Acquisition and misfire scans: WHERE TRIGGER_STATE = ? AND NEXT_FIRE_TIME <= ?
        CREATE INDEX IF NOT EXISTS {prefix}IDX_T_NFT_ST
            ON {prefix}TRIGGERS (SCHED_NAME, TRIGGER_STATE, NEXT_FIRE_TIME);
        CREATE INDEX IF NOT EXISTS {prefix}IDX_T_J
            ON {prefix}TRIGGERS (SCHED_NAME, JOB_NAME, JOB_GROUP);
        CREATE INDEX IF NOT EXISTS {prefix}IDX_T_C
            ON {prefix}TRIGGERS (SCHED_NAME, CALENDAR_NAME);",
        prefix,
    ))
}

fn create_calendars_table(conn: &Connection, prefix: &str) -> Result<()> {
    conn.execute_batch(&rtp(
        "CREATE TABLE IF NOT EXISTS {prefix}CALENDARS (
            SCHED_NAME      TEXT NOT NULL,
            CALENDAR_NAME   TEXT NOT NULL,
            CALENDAR        TEXT NOT NULL,   -- JSON
            PRIMARY KEY (SCHED_NAME, CALENDAR_NAME)
        ) STRICT;",
        prefix,
    ))
}

fn create_paused_groups_table(conn: &Connection, prefix: &str) -> Result<()> {
    conn.execute_batch(&rtp(
        "CREATE TABLE IF NOT EXISTS {prefix}PAUSED_TRIGGER_GRPS (
            SCHED_NAME      TEXT NOT NULL,
            TRIGGER_GROUP   TEXT NOT NULL,
            PRIMARY KEY (SCHED_NAME, TRIGGER_GROUP)
        ) STRICT;",
        prefix,
    ))
}

/// One row per in-flight fire. JOB_NAME/JOB_GROUP stay NULL until the
/// trigger is actually fired.
fn create_fired_triggers_table(conn: &Connection, prefix: &str) -> Result<()> {
    conn.execute_batch(&rtp(
        "CREATE TABLE IF NOT EXISTS {prefix}FIRED_TRIGGERS (
            SCHED_NAME          TEXT    NOT NULL,
            ENTRY_ID            TEXT    NOT NULL,
            TRIGGER_NAME        TEXT    NOT NULL,
            TRIGGER_GROUP       TEXT    NOT NULL,
            INSTANCE_NAME       TEXT    NOT NULL,
            FIRED_TIME          INTEGER NOT NULL,
            SCHED_TIME          INTEGER NOT NULL,
            PRIORITY            INTEGER NOT NULL,
            STATE               TEXT    NOT NULL,
            JOB_NAME            TEXT,
            JOB_GROUP           TEXT,
            IS_NONCONCURRENT    INTEGER NOT NULL,
            REQUESTS_RECOVERY   INTEGER NOT NULL,
            PRIMARY KEY (SCHED_NAME, ENTRY_ID)
        ) STRICT;

        CREATE INDEX IF NOT EXISTS {prefix}IDX_FT_INST
            ON {prefix}FIRED_TRIGGERS (SCHED_NAME, INSTANCE_NAME);
        CREATE INDEX IF NOT EXISTS {prefix}IDX_FT_T
            ON {prefix}FIRED_TRIGGERS (SCHED_NAME, TRIGGER_NAME, TRIGGER_GROUP);
        CREATE INDEX IF NOT EXISTS {prefix}IDX_FT_J
            ON {prefix}FIRED_TRIGGERS (SCHED_NAME, JOB_NAME, JOB_GROUP);",
        prefix,
    ))
}

fn create_scheduler_state_table(conn: &Connection, prefix: &str) -> Result<()> {
    conn.execute_batch(&rtp(
        "CREATE TABLE IF NOT EXISTS {prefix}SCHEDULER_STATE (
            SCHED_NAME          TEXT    NOT NULL,
            INSTANCE_NAME       TEXT    NOT NULL,
            LAST_CHECKIN_TIME   INTEGER NOT NULL,
            CHECKIN_INTERVAL    INTEGER NOT NULL,
            PRIMARY KEY (SCHED_NAME, INSTANCE_NAME)
        ) STRICT;",
        prefix,
    ))
}

/// Existence of a row is the lock; rows are inserted on first use.
fn create_locks_table(conn: &Connection, prefix: &str) -> Result<()> {
    conn.execute_batch(&rtp(
        "CREATE TABLE IF NOT EXISTS {prefix}LOCKS (
            SCHED_NAME  TEXT NOT NULL,
            LOCK_NAME   TEXT NOT NULL,
            PRIMARY KEY (SCHED_NAME, LOCK_NAME)
        ) STRICT;",
        prefix,
    ))
}
