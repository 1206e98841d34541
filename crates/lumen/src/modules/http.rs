//! The `ctx` handed to HTTP handler scripts.

use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use http::{
    HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri,
    header::{CONTENT_TYPE, COOKIE, LOCATION, SET_COOKIE},
};
use mlua::{AnyUserData, IntoLua, Lua, MultiValue, Table, Value};
use parking_lot::Mutex;

use super::{
    json_to_lua, lua_to_json,
    session::{self, LazySession, SESSION_COOKIE, SessionStore},
};
use crate::bridge::{self, Surface};

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
const APPLICATION_JSON: &str = "application/json";
const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// What the host knows about an inbound request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub params: HashMap<String, String>,
}

impl HttpRequest {
    #[must_use]
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            params: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub fn with_params(mut self, params: HashMap<String, String>) -> Self {
        self.params = params;
        self
    }

    #[must_use]
    pub fn query(&self) -> HashMap<String, String> {
        self.uri
            .query()
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .into_owned()
                    .collect()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn cookies(&self) -> HashMap<String, String> {
        self.headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                Some((name.to_string(), value.to_string()))
            })
            .collect()
    }

    /// Url-encoded form fields, empty unless the body is a form.
    #[must_use]
    pub fn form(&self) -> HashMap<String, String> {
        let is_form = self
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with(FORM_URLENCODED));
        if !is_form {
            return HashMap::new();
        }
        url::form_urlencoded::parse(&self.body).into_owned().collect()
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    #[must_use]
    pub fn body_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

/// Response being assembled by the script.
#[derive(Debug, Default)]
struct Directive {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: Option<Bytes>,
    redirect: Option<(StatusCode, HeaderValue)>,
}

fn status_code(code: i64) -> mlua::Result<StatusCode> {
    u16::try_from(code)
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| mlua::Error::runtime(format!("invalid status code {code}")))
}

fn header_name(name: &str) -> mlua::Result<HeaderName> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| mlua::Error::runtime(format!("invalid header name '{name}'")))
}

fn header_value(value: &str) -> mlua::Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|_| mlua::Error::runtime("invalid header value"))
}

fn as_status(value: &Value) -> Option<i64> {
    match value {
        Value::Integer(i) => Some(*i),
        #[allow(clippy::cast_possible_truncation)]
        Value::Number(n) if n.fract() == 0.0 => Some(*n as i64),
        _ => None,
    }
}

fn string_map(lua: &Lua, map: &HashMap<String, String>) -> mlua::Result<Table> {
    let table = lua.create_table_with_capacity(0, map.len())?;
    for (key, value) in map {
        table.set(key.as_str(), value.as_str())?;
    }
    Ok(table)
}

/// Cookies of the request plus the ones the script sets.
struct CookieJar {
    incoming: HashMap<String, String>,
    response: Arc<Mutex<Directive>>,
}

impl CookieJar {
    fn append(&self, cookie: &str) -> mlua::Result<()> {
        let value = header_value(cookie)?;
        self.response.lock().headers.append(SET_COOKIE, value);
        Ok(())
    }
}

fn cookie_surface() -> Surface<CookieJar> {
    Surface::new()
        .method(
            "set",
            |_, jar: &CookieJar, (name, value, opts): (String, String, Option<Table>)| {
                let mut cookie = format!("{name}={value}");
                let path = match &opts {
                    Some(opts) => opts.get::<Option<String>>("path")?,
                    None => None,
                };
                cookie.push_str("; Path=");
                cookie.push_str(path.as_deref().unwrap_or("/"));
                if let Some(opts) = &opts {
                    if let Some(max_age) = opts.get::<Option<i64>>("max_age")? {
                        cookie.push_str(&format!("; Max-Age={max_age}"));
                    }
                    if let Some(domain) = opts.get::<Option<String>>("domain")? {
                        cookie.push_str(&format!("; Domain={domain}"));
                    }
                    if let Some(same_site) = opts.get::<Option<String>>("same_site")? {
                        cookie.push_str(&format!("; SameSite={same_site}"));
                    }
                    if opts.get::<Option<bool>>("secure")?.unwrap_or(false) {
                        cookie.push_str("; Secure");
                    }
                    if opts.get::<Option<bool>>("http_only")?.unwrap_or(true) {
                        cookie.push_str("; HttpOnly");
                    }
                } else {
                    cookie.push_str("; HttpOnly");
                }
                jar.append(&cookie)
            },
        )
        .method("clear", |_, jar: &CookieJar, name: String| {
            jar.append(&format!("{name}=; Path=/; Max-Age=0"))
        })
        .index(|lua, jar, key| match jar.incoming.get(key) {
            Some(value) => value.as_str().into_lua(lua),
            None => Ok(Value::Nil),
        })
}

/// Per-request state behind `ctx`.
pub struct RequestContext {
    id: String,
    request: Arc<HttpRequest>,
    response: Arc<Mutex<Directive>>,
    cookies: Arc<CookieJar>,
    state: Arc<Mutex<HashMap<String, serde_json::Value>>>,
    session: Arc<LazySession>,
}

impl RequestContext {
    #[must_use]
    pub fn new(request: HttpRequest, sessions: Arc<dyn SessionStore>) -> Arc<Self> {
        let incoming = request.cookies();
        let session = LazySession::new(sessions, incoming.get(SESSION_COOKIE).cloned());
        let response = Arc::new(Mutex::new(Directive::default()));
        Arc::new(Self {
            id: format!("{:016x}", rand::random::<u64>()),
            request: Arc::new(request),
            cookies: Arc::new(CookieJar {
                incoming,
                response: response.clone(),
            }),
            response,
            state: Arc::new(Mutex::new(HashMap::new())),
            session: Arc::new(session),
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn session(&self) -> &LazySession {
        &self.session
    }

    /// The `ctx` handle for a script.
    ///
    /// # Errors
    /// Returns an error if the userdata cannot be allocated.
    pub fn handle(self: &Arc<Self>, lua: &Lua) -> mlua::Result<AnyUserData> {
        bridge::anonymous(lua, self.clone(), surface())
    }

    /// The response assembled so far. Redirects win over status and body.
    #[must_use]
    pub fn response(&self) -> HttpResponse {
        let directive = std::mem::take(&mut *self.response.lock());
        let mut headers = directive.headers;
        if let Some(cookie) = self
            .session
            .take_cookie()
            .and_then(|c| HeaderValue::from_str(&c).ok())
        {
            headers.append(SET_COOKIE, cookie);
        }

        if let Some((status, location)) = directive.redirect {
            headers.insert(LOCATION, location);
            return HttpResponse {
                status,
                headers,
                body: Bytes::new(),
            };
        }

        let body = directive.body.unwrap_or_default();
        if !body.is_empty() && !headers.contains_key(CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_PLAIN));
        }
        HttpResponse {
            status: directive.status.unwrap_or(StatusCode::OK),
            headers,
            body,
        }
    }

    fn field(&self, lua: &Lua, key: &str) -> mlua::Result<Value> {
        let request = &self.request;
        match key {
            "id" => self.id.as_str().into_lua(lua),
            "method" => request.method.as_str().into_lua(lua),
            "url" => request.uri.to_string().into_lua(lua),
            "path" => request.uri.path().into_lua(lua),
            "body" => lua.create_string(&request.body).map(Value::String),
            "query" => string_map(lua, &request.query()).map(Value::Table),
            "params" => string_map(lua, &request.params).map(Value::Table),
            "headers" => {
                let request = self.request.clone();
                let response = self.response.clone();
                bridge::read_write(
                    lua,
                    move |lua, name| match request.headers.get(name).map(HeaderValue::to_str) {
                        Some(Ok(value)) => value.into_lua(lua),
                        _ => Ok(Value::Nil),
                    },
                    move |_, name, value| {
                        let name = header_name(name)?;
                        let mut response = response.lock();
                        match value {
                            Value::Nil => {
                                response.headers.remove(name);
                            }
                            value => {
                                let text = value
                                    .to_string()
                                    .map_err(|_| mlua::Error::runtime("invalid header value"))?;
                                response.headers.insert(name, header_value(&text)?);
                            }
                        }
                        Ok(())
                    },
                )
                .map(Value::UserData)
            }
            "cookies" => {
                bridge::anonymous(lua, self.cookies.clone(), cookie_surface()).map(Value::UserData)
            }
            "state" => {
                let (get_state, set_state) = (self.state.clone(), self.state.clone());
                bridge::read_write(
                    lua,
                    move |lua, key| match get_state.lock().get(key) {
                        Some(value) => json_to_lua(lua, value),
                        None => Ok(Value::Nil),
                    },
                    move |lua, key, value| {
                        let mut state = set_state.lock();
                        if value.is_nil() {
                            state.remove(key);
                        } else {
                            state.insert(key.to_string(), lua_to_json(lua, value)?);
                        }
                        Ok(())
                    },
                )
                .map(Value::UserData)
            }
            "sess" => session::handle(lua, self.session.clone()).map(Value::UserData),
            "form" => {
                bridge::read_only_strings(lua, Arc::new(request.form())).map(Value::UserData)
            }
            _ => Ok(Value::Nil),
        }
    }

    fn send(&self, lua: &Lua, args: MultiValue) -> mlua::Result<()> {
        let mut args = args.into_iter();
        let (status, body) = match (args.next(), args.next()) {
            (None, _) => (None, Value::Nil),
            (Some(body), None) => (None, body),
            (Some(status), Some(body)) => {
                let code = as_status(&status)
                    .ok_or_else(|| mlua::Error::runtime("send expects (status, body) or (body)"))?;
                (Some(status_code(code)?), body)
            }
        };

        let mut json = false;
        let bytes = match body {
            Value::Nil => Bytes::new(),
            Value::String(s) => Bytes::copy_from_slice(&s.as_bytes()),
            Value::Table(_) => {
                json = true;
                let value = lua_to_json(lua, body)?;
                serde_json::to_vec(&value).map_err(mlua::Error::external)?.into()
            }
            other => Bytes::from(
                other
                    .to_string()
                    .map_err(|_| mlua::Error::runtime("unsupported body type"))?,
            ),
        };

        let mut response = self.response.lock();
        if let Some(status) = status {
            response.status = Some(status);
        }
        if json && !response.headers.contains_key(CONTENT_TYPE) {
            response
                .headers
                .insert(CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON));
        }
        response.body = Some(bytes);
        Ok(())
    }

    fn redirect(&self, args: MultiValue) -> mlua::Result<()> {
        let mut args = args.into_iter();
        let (status, location) = match (args.next(), args.next()) {
            (Some(status), Some(location)) => {
                let code = as_status(&status)
                    .ok_or_else(|| mlua::Error::runtime("redir expects (status, location)"))?;
                (status_code(code)?, location)
            }
            (Some(location), None) => (StatusCode::FOUND, location),
            (None, _) => return Err(mlua::Error::runtime("redir expects a location")),
        };
        let location = location
            .to_string()
            .map_err(|_| mlua::Error::runtime("redirect location must be a string"))?;
        self.response.lock().redirect = Some((status, header_value(&location)?));
        Ok(())
    }
}

fn surface() -> Surface<RequestContext> {
    Surface::new()
        .method("send", |lua, ctx: &RequestContext, args: MultiValue| {
            ctx.send(lua, args)
        })
        .method("redir", |_, ctx: &RequestContext, args: MultiValue| {
            ctx.redirect(args)
        })
        .method("status", |_, ctx: &RequestContext, code: i64| {
            ctx.response.lock().status = Some(status_code(code)?);
            Ok(())
        })
        .method("type", |_, ctx: &RequestContext, content_type: String| {
            let value = header_value(&content_type)?;
            ctx.response.lock().headers.insert(CONTENT_TYPE, value);
            Ok(())
        })
        .method(
            "set",
            |_, ctx: &RequestContext, (name, value): (String, String)| {
                let name = header_name(&name)?;
                let value = header_value(&value)?;
                ctx.response.lock().headers.insert(name, value);
                Ok(())
            },
        )
        .method("get", |lua, ctx: &RequestContext, name: String| {
            match ctx.request.headers.get(name.as_str()).map(HeaderValue::to_str) {
                Some(Ok(value)) => value.into_lua(lua),
                _ => Ok(Value::Nil),
            }
        })
        .method("json", |lua, ctx: &RequestContext, ()| {
            if ctx.request.body.is_empty() {
                return Ok(Value::Nil);
            }
            let value: serde_json::Value =
                serde_json::from_slice(&ctx.request.body).map_err(mlua::Error::external)?;
            json_to_lua(lua, &value)
        })
        .index(|lua, ctx, key| ctx.field(lua, key))
}
