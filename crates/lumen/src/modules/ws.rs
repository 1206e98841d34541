//! The `ws` context handed to WebSocket route scripts.
//!
//! Scripts run on a blocking thread while the socket lives on the async
//! runtime; the two sides talk over bounded channels.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Bytes;
use http::HeaderValue;
use mlua::{IntoLua, Lua, MultiValue, Value};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{http::HttpRequest, lua_to_json};
use crate::bridge::{self, Surface};

/// Close code sent when the script ends without choosing one.
pub const NORMAL_CLOSURE: u16 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Close(Option<(u16, String)>),
}

/// Socket-side ends of a script connection.
#[derive(Debug)]
pub struct WsPeer {
    /// Frames read from the client, delivered to `ws:recv()`.
    pub incoming: mpsc::Sender<WsMessage>,
    /// Frames produced by the script.
    pub outgoing: mpsc::Receiver<WsMessage>,
}

pub struct WsContext {
    request: Arc<HttpRequest>,
    incoming: Mutex<mpsc::Receiver<WsMessage>>,
    outgoing: mpsc::Sender<WsMessage>,
    closed: AtomicBool,
}

impl WsContext {
    #[must_use]
    pub fn new(request: HttpRequest, capacity: usize) -> (Arc<Self>, WsPeer) {
        let (incoming_tx, incoming_rx) = mpsc::channel(capacity);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(capacity);
        let context = Arc::new(Self {
            request: Arc::new(request),
            incoming: Mutex::new(incoming_rx),
            outgoing: outgoing_tx,
            closed: AtomicBool::new(false),
        });
        (
            context,
            WsPeer {
                incoming: incoming_tx,
                outgoing: outgoing_rx,
            },
        )
    }

    /// # Errors
    /// Returns an error if the userdata cannot be allocated.
    pub fn handle(self: &Arc<Self>, lua: &Lua) -> mlua::Result<mlua::AnyUserData> {
        bridge::anonymous(lua, self.clone(), surface())
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Sends a close frame unless the script already did.
    pub fn finish(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self
                .outgoing
                .blocking_send(WsMessage::Close(Some((NORMAL_CLOSURE, String::new()))));
        }
    }

    fn push(&self, message: WsMessage) -> mlua::Result<()> {
        if self.is_closed() {
            return Err(mlua::Error::runtime("websocket is closed"));
        }
        self.outgoing
            .blocking_send(message)
            .map_err(|_| mlua::Error::runtime("websocket is closed"))
    }

    fn recv(&self, lua: &Lua) -> mlua::Result<MultiValue> {
        if self.is_closed() {
            return Ok(MultiValue::new());
        }
        let mut incoming = self.incoming.lock();
        loop {
            let message = incoming.blocking_recv();
            let (kind, payload) = match message {
                Some(WsMessage::Text(text)) => ("text", lua.create_string(text)?),
                Some(WsMessage::Binary(data)) => ("binary", lua.create_string(&data)?),
                Some(WsMessage::Ping(_)) => continue,
                Some(WsMessage::Close(_)) | None => {
                    self.closed.store(true, Ordering::Release);
                    return Ok(MultiValue::new());
                }
            };
            return Ok(MultiValue::from_iter([
                kind.into_lua(lua)?,
                Value::String(payload),
            ]));
        }
    }

    fn field(&self, lua: &Lua, key: &str) -> mlua::Result<Value> {
        match key {
            "path" => self.request.uri.path().into_lua(lua),
            "headers" => {
                let request = self.request.clone();
                bridge::read_only(lua, move |lua, name| {
                    match request.headers.get(name).map(HeaderValue::to_str) {
                        Some(Ok(value)) => value.into_lua(lua),
                        _ => Ok(Value::Nil),
                    }
                })
                .map(Value::UserData)
            }
            "params" => bridge::read_only_strings(lua, Arc::new(self.request.params.clone()))
                .map(Value::UserData),
            "query" => {
                let query: HashMap<String, String> = self.request.query();
                bridge::read_only_strings(lua, Arc::new(query)).map(Value::UserData)
            }
            _ => Ok(Value::Nil),
        }
    }
}

fn surface() -> Surface<WsContext> {
    Surface::new()
        .method(
            "send",
            |lua, ws: &WsContext, (message, binary): (Value, Option<bool>)| {
                let message = match message {
                    Value::Table(_) => {
                        let json = lua_to_json(lua, message)?;
                        WsMessage::Text(json.to_string())
                    }
                    Value::String(s) if binary.unwrap_or(false) => {
                        WsMessage::Binary(Bytes::copy_from_slice(&s.as_bytes()))
                    }
                    other => WsMessage::Text(
                        other
                            .to_string()
                            .map_err(|_| mlua::Error::runtime("unsupported message type"))?,
                    ),
                };
                ws.push(message)
            },
        )
        .method("recv", |lua, ws: &WsContext, ()| ws.recv(lua))
        .method("ping", |_, ws: &WsContext, ()| {
            ws.push(WsMessage::Ping(Bytes::new()))
        })
        .method(
            "close",
            |_, ws: &WsContext, (code, reason): (Option<u16>, Option<String>)| {
                if ws.closed.swap(true, Ordering::AcqRel) {
                    return Ok(());
                }
                let frame = (code.unwrap_or(NORMAL_CLOSURE), reason.unwrap_or_default());
                let _ = ws.outgoing.blocking_send(WsMessage::Close(Some(frame)));
                Ok(())
            },
        )
        .index(|lua, ws, key| ws.field(lua, key))
}

#[cfg(test)]
mod tests {
    use std::thread;

    use http::Method;

    use super::*;

    fn request() -> HttpRequest {
        HttpRequest::new(Method::GET, "/chat?room=lobby".parse().unwrap())
    }

    #[test]
    fn echoes_until_client_closes() {
        let (ws, mut peer) = WsContext::new(request(), 8);
        let script = thread::spawn(move || {
            let lua = Lua::new();
            lua.load(
                r#"
                local ws = ...
                ws:send("joined " .. ws.query.room)
                while true do
                    local kind, payload = ws:recv()
                    if kind == nil then break end
                    ws:send(kind .. ":" .. payload)
                end
                "#,
            )
            .call::<()>(ws.handle(&lua).unwrap())
            .unwrap();
            ws.finish();
        });

        assert_eq!(
            peer.outgoing.blocking_recv(),
            Some(WsMessage::Text("joined lobby".into()))
        );
        peer.incoming
            .blocking_send(WsMessage::Text("hi".into()))
            .unwrap();
        assert_eq!(
            peer.outgoing.blocking_recv(),
            Some(WsMessage::Text("text:hi".into()))
        );
        peer.incoming.blocking_send(WsMessage::Close(None)).unwrap();
        assert_eq!(
            peer.outgoing.blocking_recv(),
            Some(WsMessage::Close(Some((NORMAL_CLOSURE, String::new()))))
        );
        script.join().unwrap();
    }

    #[test]
    fn tables_are_sent_as_json_and_close_is_final() {
        let (ws, mut peer) = WsContext::new(request(), 8);
        let lua = Lua::new();
        lua.load(
            r#"
            local ws = ...
            ws:send({ n = 1 })
            ws:close(4000, "bye")
            assert(not pcall(ws.send, ws, "late"))
            "#,
        )
        .call::<()>(ws.handle(&lua).unwrap())
        .unwrap();
        ws.finish();

        assert_eq!(
            peer.outgoing.blocking_recv(),
            Some(WsMessage::Text(r#"{"n":1}"#.into()))
        );
        assert_eq!(
            peer.outgoing.blocking_recv(),
            Some(WsMessage::Close(Some((4000, "bye".into()))))
        );
        drop(ws);
        drop(lua);
        assert_eq!(peer.outgoing.blocking_recv(), None);
    }
}
