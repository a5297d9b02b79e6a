//! Queue statements.
//!
//! sqlx prepares and caches each statement per connection, so these play the
//! role of named prepared statements.

/// Inserts a job. NULL queue, priority, run_at or args take the defaults.
pub const ENQUEUE: &str = r#"
INSERT INTO jobs (queue, priority, run_at, type, args)
VALUES (
    coalesce($1::text, ''::text),
    coalesce($2::smallint, 100::smallint),
    coalesce($3::timestamptz, now()),
    $4::text,
    coalesce($5::jsonb, '{}'::jsonb)
)
RETURNING id
"#;

/// Finds the first runnable job in `$1` that no other session has locked and
/// takes a session advisory lock on it.
///
/// Walks the primary key one row at a time, trying the advisory lock on each
/// candidate, and stops at the first row it manages to lock.
pub const LOCK_JOB: &str = r#"
WITH RECURSIVE candidates AS (
    SELECT (j).*, pg_try_advisory_lock((j).id) AS locked
    FROM (
        SELECT j
        FROM jobs AS j
        WHERE queue = $1::text
          AND run_at <= now()
          AND locked_until <= now()
        ORDER BY priority, run_at, id
        LIMIT 1
    ) AS t1
    UNION ALL (
        SELECT (j).*, pg_try_advisory_lock((j).id) AS locked
        FROM (
            SELECT (
                SELECT j
                FROM jobs AS j
                WHERE queue = $1::text
                  AND run_at <= now()
                  AND locked_until <= now()
                  AND (priority, run_at, id) > (candidates.priority, candidates.run_at, candidates.id)
                ORDER BY priority, run_at, id
                LIMIT 1
            ) AS j
            FROM candidates
            WHERE candidates.id IS NOT NULL
            LIMIT 1
        ) AS t1
    )
)
SELECT queue, priority, run_at, id, type, args, error_count
FROM candidates
WHERE locked
LIMIT 1
"#;

/// Confirms a locked job still exists.
pub const CHECK_JOB: &str = r#"
SELECT true AS present
FROM jobs
WHERE queue = $1::text
  AND priority = $2::smallint
  AND run_at = $3::timestamptz
  AND id = $4::bigint
"#;

pub const DESTROY_JOB: &str = r#"
DELETE FROM jobs
WHERE queue = $1::text
  AND priority = $2::smallint
  AND run_at = $3::timestamptz
  AND id = $4::bigint
"#;

/// Records a failure, pushes run_at out by `$2` seconds and clears the
/// lock lease. Returns the new run_at.
pub const SET_ERROR: &str = r#"
UPDATE jobs
SET error_count = $1::integer,
    run_at = now() + $2::bigint * '1 second'::interval,
    last_error = $3::text,
    locked_until = now()
WHERE queue = $4::text
  AND priority = $5::smallint
  AND run_at = $6::timestamptz
  AND id = $7::bigint
RETURNING run_at
"#;

pub const UNLOCK_JOB: &str = "SELECT pg_advisory_unlock($1::bigint)";

/// Sets locked_until to now + `$1` seconds.
pub const SET_LOCK: &str = r#"
UPDATE jobs
SET locked_until = now() + $1::bigint * '1 second'::interval
WHERE queue = $2::text
  AND priority = $3::smallint
  AND run_at = $4::timestamptz
  AND id = $5::bigint
"#;
