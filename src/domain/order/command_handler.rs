use crate::error::{EsError, EsResult};
use crate::event_sourcing::{
    AggregateManager, AggregateRoot, CommandContext, CommandOutcome, TransactionManager,
};

use super::aggregate::OrderAggregate;
use super::commands::OrderCommand;

// ============================================================================
// Order Command Handler
// ============================================================================
//
// Orchestrates: Command → Aggregate → staged events → AggregateManager
// (one transaction per command, events + outbox together)
//
// ============================================================================

/// Run `command` against a root inside a command context. Returns the number
/// of events staged.
pub fn execute_command(root: &mut AggregateRoot<OrderAggregate>, command: &OrderCommand) -> EsResult<usize> {
    if let OrderCommand::CreateOrder { order_id, .. } = command {
        root.set_identity(order_id)?;
    }

    let events = root.state().handle_command(command)?;
    let staged = events.len();
    for event in events {
        root.stage_event(event)?;
    }
    Ok(staged)
}

pub struct OrderCommandHandler<T: TransactionManager> {
    manager: AggregateManager<OrderAggregate, T>,
}

impl<T: TransactionManager> OrderCommandHandler<T> {
    pub fn new(manager: AggregateManager<OrderAggregate, T>) -> Self {
        Self { manager }
    }

    /// Handle a command and persist resulting events
    pub async fn handle(
        &self,
        order_id: &str,
        context: CommandContext,
        command: OrderCommand,
    ) -> EsResult<CommandOutcome<usize>> {
        tracing::debug!(order_id = %order_id, command = command.name(), "Handling order command");

        match &command {
            OrderCommand::CreateOrder { order_id: id, .. } if id != order_id => {
                Err(EsError::CommandRejected(format!(
                    "CreateOrder for {} sent to {}",
                    id, order_id
                )))
            }
            OrderCommand::CreateOrder { .. } => {
                self.manager
                    .create(context, |root| execute_command(root, &command))
                    .await
            }
            _ => {
                self.manager
                    .execute_with_retry(order_id, context, |root| execute_command(root, &command))
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::order::{test_support, OrderItem};
    use crate::event_sourcing::InMemoryBackend;
    use std::sync::Arc;
    use uuid::Uuid;

    fn handler(backend: &InMemoryBackend) -> OrderCommandHandler<InMemoryBackend> {
        let manager = AggregateManager::builder(
            test_support::registry(None),
            Arc::new(backend.clone()),
            backend.stores(),
        )
        .build()
        .unwrap();
        OrderCommandHandler::new(manager)
    }

    fn create(order_id: &str) -> OrderCommand {
        OrderCommand::CreateOrder {
            order_id: order_id.to_string(),
            customer_id: Uuid::new_v4(),
            items: vec![OrderItem {
                product_id: Uuid::new_v4(),
                quantity: 1,
            }],
        }
    }

    #[tokio::test]
    async fn test_order_lifecycle() {
        let backend = InMemoryBackend::new();
        let handler = handler(&backend);

        let outcome = handler
            .handle("o-1", CommandContext::new().with_tenant("acme"), create("o-1"))
            .await
            .unwrap();
        assert_eq!(outcome.sequence_number, 1);
        assert_eq!(outcome.result, 1);
        assert_eq!(outcome.events[0].event_type, "OrderCreated");

        handler
            .handle("o-1", CommandContext::new(), OrderCommand::ConfirmOrder)
            .await
            .unwrap();
        let outcome = handler
            .handle(
                "o-1",
                CommandContext::new(),
                OrderCommand::ShipOrder {
                    tracking_number: "TRACK-1".to_string(),
                    carrier: "DHL".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.sequence_number, 3);

        let events = backend.committed_events("o-1").await;
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["OrderCreated", "OrderConfirmed", "OrderShipped"]);
        assert_eq!(events[0].tenant_id.as_deref(), Some("acme"));
    }

    #[tokio::test]
    async fn test_rejected_command_writes_nothing() {
        let backend = InMemoryBackend::new();
        let handler = handler(&backend);
        handler
            .handle("o-1", CommandContext::new(), create("o-1"))
            .await
            .unwrap();

        let err = handler
            .handle(
                "o-1",
                CommandContext::new(),
                OrderCommand::DeliverOrder { signature: None },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EsError::CommandRejected(_)));
        assert_eq!(backend.committed_events("o-1").await.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_create_is_rejected() {
        let backend = InMemoryBackend::new();
        let handler = handler(&backend);
        handler
            .handle("o-1", CommandContext::new(), create("o-1"))
            .await
            .unwrap();

        let err = handler
            .handle("o-1", CommandContext::new(), create("o-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, EsError::CommandRejected(_)));
    }

    #[tokio::test]
    async fn test_mismatched_create_id_is_rejected() {
        let backend = InMemoryBackend::new();
        let err = handler(&backend)
            .handle("o-1", CommandContext::new(), create("o-2"))
            .await
            .unwrap_err();
        assert!(matches!(err, EsError::CommandRejected(_)));
        assert!(backend.committed_events("o-2").await.is_empty());
    }

    #[tokio::test]
    async fn test_command_on_missing_order() {
        let backend = InMemoryBackend::new();
        let err = handler(&backend)
            .handle("ghost", CommandContext::new(), OrderCommand::ConfirmOrder)
            .await
            .unwrap_err();
        assert!(matches!(err, EsError::AggregateNotFound(_)));
    }

    #[tokio::test]
    async fn test_archived_order_rejects_commands() {
        let backend = InMemoryBackend::new();
        let handler = handler(&backend);
        handler
            .handle("o-1", CommandContext::new(), create("o-1"))
            .await
            .unwrap();
        handler
            .handle(
                "o-1",
                CommandContext::new(),
                OrderCommand::CancelOrder {
                    reason: Some("changed mind".to_string()),
                    cancelled_by: None,
                },
            )
            .await
            .unwrap();
        handler
            .handle("o-1", CommandContext::new(), OrderCommand::ArchiveOrder)
            .await
            .unwrap();

        let err = handler
            .handle("o-1", CommandContext::new(), OrderCommand::ConfirmOrder)
            .await
            .unwrap_err();
        assert!(matches!(err, EsError::CommandRejected(_)));

        let events = backend.committed_events("o-1").await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].event_type, "OrderArchived");
    }
}
