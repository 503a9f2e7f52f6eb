// Postgres tables used by `PgBackend`. Only for bootstrapping a fresh
// database; migrations are managed outside this crate.

pub const DOMAIN_EVENTS: &str = r#"
CREATE TABLE IF NOT EXISTS domain_events (
    id                     UUID        NOT NULL UNIQUE,
    origin                 TEXT        NOT NULL,
    aggregate_type         TEXT        NOT NULL,
    event_type             TEXT        NOT NULL,
    version                INT         NOT NULL,
    aggregate_id           TEXT        NOT NULL,
    sequence_number        BIGINT      NOT NULL,
    payload                JSONB       NOT NULL,
    timestamp              TIMESTAMPTZ NOT NULL,
    tenant_id              TEXT,
    correlation_id         TEXT,
    triggered_by_event_id  UUID,
    triggered_by_user_id   TEXT,
    metadata               JSONB       NOT NULL DEFAULT '{}'::jsonb,
    PRIMARY KEY (aggregate_id, sequence_number)
)"#;

pub const SNAPSHOTS: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots (
    origin           TEXT        NOT NULL,
    aggregate_type   TEXT        NOT NULL,
    aggregate_id     TEXT        NOT NULL,
    sequence_number  BIGINT      NOT NULL,
    data             JSONB       NOT NULL,
    created_at       TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (aggregate_id, sequence_number)
)"#;

pub const OUTBOX_MESSAGES: &str = r#"
CREATE TABLE IF NOT EXISTS outbox_messages (
    position         BIGSERIAL   NOT NULL UNIQUE,
    event_id         UUID        PRIMARY KEY,
    channel_id       TEXT        NOT NULL,
    aggregate_id     TEXT        NOT NULL,
    sequence_number  BIGINT      NOT NULL,
    event            JSONB       NOT NULL,
    message          JSONB       NOT NULL,
    created_at       TIMESTAMPTZ NOT NULL DEFAULT now(),
    published_at     TIMESTAMPTZ,
    attempts         INT         NOT NULL DEFAULT 0,
    last_error       TEXT,
    dead_lettered    BOOLEAN     NOT NULL DEFAULT FALSE
)"#;

pub const OUTBOX_UNPUBLISHED_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS outbox_messages_unpublished
    ON outbox_messages (position)
    WHERE published_at IS NULL AND NOT dead_lettered"#;

// tenant_id is '' for "no tenant" so the primary key stays total. Ledger
// keys never carry an empty tenant id, see ConsumedMessage::new.
pub const CONSUMED_MESSAGES: &str = r#"
CREATE TABLE IF NOT EXISTS consumed_messages (
    domain_event_id  UUID        NOT NULL,
    consumer_id      TEXT        NOT NULL,
    tenant_id        TEXT        NOT NULL DEFAULT '',
    consumed_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (domain_event_id, consumer_id, tenant_id)
)"#;

pub const DEAD_LETTER_QUEUE: &str = r#"
CREATE TABLE IF NOT EXISTS dead_letter_queue (
    event_id         UUID        PRIMARY KEY,
    aggregate_id     TEXT        NOT NULL,
    channel_id       TEXT        NOT NULL,
    event_type       TEXT        NOT NULL,
    payload          TEXT        NOT NULL,
    error_message    TEXT        NOT NULL,
    failure_count    INT         NOT NULL,
    first_failed_at  TIMESTAMPTZ NOT NULL,
    last_failed_at   TIMESTAMPTZ NOT NULL,
    created_at       TIMESTAMPTZ NOT NULL DEFAULT now()
)"#;

pub const ORDER_SUMMARIES: &str = r#"
CREATE TABLE IF NOT EXISTS order_summaries (
    order_id         TEXT        PRIMARY KEY,
    tenant_id        TEXT,
    customer_id      TEXT        NOT NULL,
    status           TEXT        NOT NULL,
    item_count       BIGINT      NOT NULL,
    events_applied   BIGINT      NOT NULL,
    updated_at       TIMESTAMPTZ NOT NULL DEFAULT now()
)"#;

/// Every statement, in creation order
pub const ALL: &[&str] = &[
    DOMAIN_EVENTS,
    SNAPSHOTS,
    OUTBOX_MESSAGES,
    OUTBOX_UNPUBLISHED_INDEX,
    CONSUMED_MESSAGES,
    DEAD_LETTER_QUEUE,
    ORDER_SUMMARIES,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniqueness_keys_present() {
        assert!(DOMAIN_EVENTS.contains("PRIMARY KEY (aggregate_id, sequence_number)"));
        assert!(CONSUMED_MESSAGES.contains("PRIMARY KEY (domain_event_id, consumer_id, tenant_id)"));
        assert!(OUTBOX_MESSAGES.contains("event_id         UUID        PRIMARY KEY"));
    }

    #[test]
    fn test_statements_are_idempotent() {
        for statement in ALL {
            assert!(statement.contains("IF NOT EXISTS"), "{statement}");
        }
    }
}
