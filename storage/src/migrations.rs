//! Forward-only schema migrations.
//!
//! Each migration runs in its own transaction and is recorded in
//! `schema_migrations`. Applied migrations are never edited; schema changes
//! append a new version.

use sqlx::PgPool;
use tracing::{debug, info};

pub struct Migration {
    pub version: i32,
    pub description: &'static str,
    pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "notebooks and entries",
        sql: r"
            CREATE TABLE notebooks (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                group_id TEXT,
                classification TEXT,
                compartments TEXT[] NOT NULL DEFAULT '{}',
                current_sequence BIGINT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL
            );

            CREATE TABLE entries (
                id UUID PRIMARY KEY,
                notebook_id UUID NOT NULL REFERENCES notebooks(id),
                content TEXT NOT NULL,
                content_type TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                author_id TEXT NOT NULL,
                signature TEXT NOT NULL,
                sequence BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                topic TEXT,
                revision_of UUID,
                fragment_of UUID,
                fragment_index INT,
                refs UUID[] NOT NULL DEFAULT '{}',
                claims JSONB NOT NULL DEFAULT '[]',
                claims_status TEXT NOT NULL DEFAULT 'pending',
                embedding REAL[],
                max_friction DOUBLE PRECISION,
                integration_cost JSONB,
                integration_status TEXT NOT NULL DEFAULT 'probation',
                needs_review BOOLEAN NOT NULL DEFAULT FALSE,
                metric_version TEXT,
                version BIGINT NOT NULL DEFAULT 0,
                UNIQUE (notebook_id, sequence)
            );

            CREATE INDEX idx_entries_topic ON entries(notebook_id, topic);
            CREATE INDEX idx_entries_refs ON entries USING GIN (refs);
            CREATE INDEX idx_entries_revision_of ON entries(revision_of);
        ",
    },
    Migration {
        version: 2,
        description: "job ledger",
        sql: r"
            CREATE TABLE jobs (
                id UUID PRIMARY KEY,
                notebook_id UUID NOT NULL,
                entry_id UUID NOT NULL,
                job_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                payload JSONB NOT NULL DEFAULT '{}',
                result JSONB,
                error TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                claimed_at TIMESTAMPTZ,
                claimed_by TEXT,
                completed_at TIMESTAMPTZ,
                timeout_seconds INT NOT NULL,
                retry_count INT NOT NULL DEFAULT 0,
                max_retries INT NOT NULL,
                priority INT NOT NULL DEFAULT 0,
                CHECK (retry_count <= max_retries)
            );

            CREATE INDEX idx_jobs_claimable ON jobs(status, priority DESC, created_at);
            CREATE INDEX idx_jobs_entry ON jobs(entry_id);
        ",
    },
    Migration {
        version: 3,
        description: "subscriptions and mirrored claims",
        sql: r"
            CREATE TABLE subscriptions (
                id UUID PRIMARY KEY,
                source_notebook_id UUID NOT NULL REFERENCES notebooks(id),
                target_notebook_id UUID NOT NULL REFERENCES notebooks(id),
                filter JSONB NOT NULL DEFAULT '{}',
                watermark BIGINT NOT NULL DEFAULT 0,
                created_by TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            );

            CREATE TABLE mirrored_claims (
                subscription_id UUID NOT NULL REFERENCES subscriptions(id),
                source_entry_id UUID NOT NULL,
                source_notebook_id UUID NOT NULL,
                claims JSONB NOT NULL,
                topic TEXT,
                embedding REAL[],
                source_sequence BIGINT NOT NULL,
                tombstoned BOOLEAN NOT NULL DEFAULT FALSE,
                mirrored_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (subscription_id, source_entry_id)
            );

            CREATE INDEX idx_mirrored_claims_source ON mirrored_claims(source_entry_id);

            CREATE TABLE retracted_entries (
                entry_id UUID PRIMARY KEY,
                retracted_at TIMESTAMPTZ NOT NULL
            );
        ",
    },
    Migration {
        version: 4,
        description: "access control and audit log",
        sql: r"
            CREATE TABLE access_grants (
                notebook_id UUID NOT NULL REFERENCES notebooks(id),
                author_id TEXT NOT NULL,
                can_read BOOLEAN NOT NULL,
                can_write BOOLEAN NOT NULL,
                can_admin BOOLEAN NOT NULL,
                granted_by TEXT NOT NULL,
                granted_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (notebook_id, author_id)
            );

            CREATE TABLE group_memberships (
                group_id TEXT NOT NULL,
                author_id TEXT NOT NULL,
                role TEXT NOT NULL,
                PRIMARY KEY (group_id, author_id)
            );

            CREATE TABLE clearances (
                author_id TEXT PRIMARY KEY,
                level TEXT NOT NULL,
                compartments TEXT[] NOT NULL DEFAULT '{}'
            );

            CREATE TABLE audit_log (
                id UUID PRIMARY KEY,
                notebook_id UUID,
                actor TEXT NOT NULL,
                action TEXT NOT NULL,
                outcome TEXT NOT NULL,
                target TEXT,
                details JSONB NOT NULL DEFAULT 'null',
                occurred_at TIMESTAMPTZ NOT NULL
            );

            CREATE INDEX idx_audit_log_notebook ON audit_log(notebook_id, occurred_at DESC);
        ",
    },
];

/// Applies every migration newer than the recorded schema version. Returns
/// the versions applied by this call.
pub async fn run_migrations(pool: &PgPool) -> Result<Vec<i32>, sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INT PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )",
    )
    .execute(pool)
    .await?;

    let mut applied = Vec::new();
    for migration in MIGRATIONS {
        let mut tx = pool.begin().await?;

        // Serializes concurrent migrators; released at commit.
        sqlx::query("SELECT pg_advisory_xact_lock(7261830412)")
            .execute(&mut *tx)
            .await?;

        let (current,): (i32,) =
            sqlx::query_as("SELECT COALESCE(MAX(version), 0) FROM schema_migrations")
                .fetch_one(&mut *tx)
                .await?;
        if current >= migration.version {
            debug!(version = migration.version, "Migration already applied");
            tx.rollback().await?;
            continue;
        }

        info!(
            version = migration.version,
            description = migration.description,
            "Applying migration"
        );
        sqlx::raw_sql(migration.sql).execute(&mut *tx).await?;
        sqlx::query("INSERT INTO schema_migrations (version, description) VALUES ($1, $2)")
            .bind(migration.version)
            .bind(migration.description)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        applied.push(migration.version);
    }

    if applied.is_empty() {
        debug!("Schema is up to date");
    }
    Ok(applied)
}
