//! Built-in protocol handlers.

use tether_engine::{Ack, Message, SendingChanges};

use super::Context;
use crate::error::{AppError, Result};

fn unexpected(expected: &str, message: &Message) -> AppError {
    AppError::BadRequest(format!(
        "expected a {} message, got '{}'",
        expected,
        message.kind()
    ))
}

/// `create`, `update` and `delete`: stamp and store the change, acknowledge
/// it, then forward it to the other subscribers of its store.
pub async fn handle_change(ctx: Context, message: Message) -> Result<()> {
    let change = match message {
        Message::Change(change) => change,
        other => return Err(unexpected("change", &other)),
    };
    let store = change.store_name().clone();
    let key = change.key().clone();

    let _guard = ctx.lock_store(&store).await;
    let saved = match ctx.log().save_change(change).await {
        Ok(saved) => saved,
        Err(e) if e.is_rejection() => {
            tracing::debug!(conn_id = %ctx.conn_id(), store = %store, key = %key, "Rejected change: {}", e);
            ctx.respond(Message::reject(Some(store), Some(key), e.to_string()));
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let timestamp = saved
        .timestamp()
        .ok_or_else(|| AppError::BadRequest("change log returned an unstamped change".into()))?;
    let new_key = (saved.key() != &key).then(|| saved.key().clone());
    ctx.respond(Message::Ok(Ack {
        store_name: store.clone(),
        key,
        new_key,
        new_version: saved.version(),
        timestamp,
    }));

    let sent = ctx.broadcast(&store, &Message::Change(saved));
    tracing::debug!(conn_id = %ctx.conn_id(), store = %store, timestamp, recipients = sent, "Change accepted");
    Ok(())
}

/// `get-changes`: stream the store's changes after `since` behind a
/// `sending-changes` header and subscribe the connection to the store.
pub async fn handle_get_changes(ctx: Context, message: Message) -> Result<()> {
    let request = match message {
        Message::GetChanges(request) => request,
        other => return Err(unexpected("get-changes", &other)),
    };

    let _guard = ctx.lock_store(&request.store_name).await;
    let changes = ctx
        .log()
        .get_changes(&request.store_name, request.since)
        .await?;

    tracing::debug!(
        conn_id = %ctx.conn_id(),
        store = %request.store_name,
        since = ?request.since,
        count = changes.len(),
        "Sending changes"
    );
    ctx.respond(Message::SendingChanges(SendingChanges {
        store_name: Some(request.store_name.clone()),
        nr_of_records_to_sync: changes.len(),
    }));
    for change in changes {
        ctx.respond(Message::Change(change));
    }
    ctx.subscribe(&request.store_name);
    Ok(())
}

/// `reset`: clear the change log.
pub async fn handle_reset(ctx: Context, _message: Message) -> Result<()> {
    ctx.log().reset_changes().await?;
    tracing::info!(conn_id = %ctx.conn_id(), "Change log reset");
    ctx.respond(Message::Reset);
    Ok(())
}

pub async fn handle_connect(ctx: Context, _message: Message) -> Result<()> {
    tracing::debug!(conn_id = %ctx.conn_id(), "Session started");
    Ok(())
}
