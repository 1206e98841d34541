use std::{future::Ready, sync::Arc};

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    response::Response,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use http::{HeaderMap, Method, Uri};
use lumen::{
    HttpRequest,
    modules::ws::{WsContext, WsMessage, WsPeer},
};
use tracing::debug;

use super::{AppState, script::RouteParams};

/// Frames buffered in each direction between socket and script.
const CHANNEL_CAPACITY: usize = 32;

/// Handler upgrading to a socket served by `script`.
pub fn endpoint(
    script: Arc<str>,
) -> impl Fn(State<AppState>, RouteParams, WebSocketUpgrade, Uri, HeaderMap) -> Ready<Response>
+ Clone
+ Send
+ Sync
+ 'static {
    move |State(state): State<AppState>,
          RouteParams(params): RouteParams,
          ws: WebSocketUpgrade,
          uri: Uri,
          headers: HeaderMap| {
        let mut request = HttpRequest::new(Method::GET, uri).with_params(params);
        request.headers = headers;
        let script = script.clone();
        std::future::ready(ws.on_upgrade(move |socket| serve(socket, state, script, request)))
    }
}

async fn serve(socket: WebSocket, state: AppState, script: Arc<str>, request: HttpRequest) {
    let (ctx, peer) = WsContext::new(request, CHANNEL_CAPACITY);
    let handler = state.handler.clone();
    let task = tokio::task::spawn_blocking(move || handler.handle_ws(&script, &ctx));

    let (sender, receiver) = socket.split();
    pump(sender, receiver, peer).await;

    if let Err(err) = task.await {
        debug!(%err, "WebSocket script task ended abnormally");
    }
}

/// Moves frames between the socket and the script until either side ends.
///
/// Both channel ends are dropped on return, so a script still sending or
/// receiving sees the socket as closed and releases its engine.
async fn pump<Tx, Rx, E>(mut sender: Tx, mut receiver: Rx, peer: WsPeer)
where
    Tx: Sink<Message> + Unpin,
    Rx: Stream<Item = Result<Message, E>> + Unpin,
{
    let WsPeer {
        incoming,
        mut outgoing,
    } = peer;
    let to_client = async {
        while let Some(message) = outgoing.recv().await {
            let closing = matches!(message, WsMessage::Close(_));
            if sender.send(to_socket(message)).await.is_err() || closing {
                break;
            }
        }
    };
    let from_client = async {
        while let Some(Ok(message)) = receiver.next().await {
            let Some(message) = from_socket(message) else {
                continue;
            };
            let closing = matches!(message, WsMessage::Close(_));
            if incoming.send(message).await.is_err() || closing {
                break;
            }
        }
    };
    tokio::select! {
        () = to_client => {},
        () = from_client => {},
    }
}

fn to_socket(message: WsMessage) -> Message {
    match message {
        WsMessage::Text(text) => Message::Text(text.into()),
        WsMessage::Binary(data) => Message::Binary(data),
        WsMessage::Ping(data) => Message::Ping(data),
        WsMessage::Close(frame) => Message::Close(frame.map(|(code, reason)| CloseFrame {
            code,
            reason: reason.into(),
        })),
    }
}

fn from_socket(message: Message) -> Option<WsMessage> {
    match message {
        Message::Text(text) => Some(WsMessage::Text(text.to_string())),
        Message::Binary(data) => Some(WsMessage::Binary(data)),
        Message::Ping(data) => Some(WsMessage::Ping(data)),
        Message::Pong(_) => None,
        Message::Close(frame) => Some(WsMessage::Close(
            frame.map(|f| (f.code, f.reason.to_string())),
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::{convert::Infallible, fs, time::Duration};

    use lumen::{Engine, ScriptCache, ScriptHandler, modules::session::MemorySessionStore};

    use super::*;

    fn handler(dir: &std::path::Path) -> ScriptHandler {
        ScriptHandler::new(
            Engine::new(lumen::EnvMap::new()).unwrap(),
            Arc::new(ScriptCache::new().unwrap()),
            dir,
            Arc::new(MemorySessionStore::new()),
        )
    }

    #[tokio::test]
    async fn client_disconnect_releases_a_sending_script() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("ticker.lua"),
            "local ws = ...\nlocal i = 0\nwhile true do i = i + 1 ws:send('tick ' .. i) end",
        )
        .unwrap();
        let handler = handler(dir.path());
        let request = HttpRequest::new(Method::GET, "/ticker".parse().unwrap());
        let (ctx, peer) = WsContext::new(request, CHANNEL_CAPACITY);

        let script = handler.clone();
        let task = tokio::task::spawn_blocking(move || script.handle_ws("ticker.lua", &ctx));
        // the client is gone before reading a single frame
        let gone = futures::stream::empty::<Result<Message, Infallible>>();
        pump(futures::sink::drain(), gone, peer).await;

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("script must not hang")
            .unwrap();
        assert!(result.is_err());
        assert_eq!(handler.engine().idle_interpreters(), 1);
    }

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("echo.lua"),
            "local ws = ...\nlocal kind, payload = ws:recv()\nws:send(kind .. ':' .. payload)",
        )
        .unwrap();
        let handler = handler(dir.path());
        let request = HttpRequest::new(Method::GET, "/echo".parse().unwrap());
        let (ctx, peer) = WsContext::new(request, CHANNEL_CAPACITY);
        let task = tokio::task::spawn_blocking(move || handler.handle_ws("echo.lua", &ctx));

        let (sink, sent) = futures::channel::mpsc::unbounded::<Message>();
        let client = futures::stream::iter([Ok::<_, Infallible>(Message::Text("hi".into()))])
            .chain(futures::stream::pending());
        tokio::time::timeout(Duration::from_secs(5), pump(sink, Box::pin(client), peer))
            .await
            .expect("pump ends on the close frame");
        task.await.unwrap().unwrap();

        let sent: Vec<Message> = sent.collect().await;
        assert_eq!(sent[0], Message::Text("text:hi".into()));
        assert!(matches!(sent[1], Message::Close(Some(ref frame)) if frame.code == 1000));
    }
}
