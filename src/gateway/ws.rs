use std::sync::Arc;

use axum::{
    debug_handler,
    extract::{
        ws::{Message, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};

use super::Gateway;

#[debug_handler(state = crate::AppState)]
pub async fn socket(State(gateway): State<Arc<Gateway>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(async move |stream| {
        let (mut session, mut outbound) = gateway.open_session();
        let connection = session.id();
        let (mut sender, mut receiver) = stream.split();

        let mut forward_task = tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                if sender.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
        });

        loop {
            tokio::select! {
                incoming = receiver.next() => match incoming {
                    Some(Ok(Message::Text(text))) => session.handle_text(text.as_str()).await,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::debug!(%connection, %err, "socket read failed");
                        break;
                    }
                },
                _ = &mut forward_task => break,
            }
        }

        session.close().await;
        forward_task.abort();
    })
}
