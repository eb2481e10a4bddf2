use std::sync::Arc;

use base64::Engine as _;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use ipnetwork::Ipv4Network;

use crate::cmdparse::{self, Command, ModifyOverride};
use crate::config;
use crate::enforcer::{CommandMessage, Modify};
use crate::iptables::{Iptables, SharedRegistry, ANY_ADDR};
use crate::iputil;

const AUTH_REALM: &str = "private";
const PERSIST_SCRIPT: &str = "/etc/init.d/iptables-persistent";

const USAGE: &str = "\
rufw - remote firewall agent

  PUT    /<target>/<chain>/<iface>/<endpoint>[/<mask>][/<iface2>[/<endpoint2>[/<mask2>]]]
  DELETE /<target>/<chain>/<iface>/<endpoint>[/<mask>][/<iface2>[/<endpoint2>[/<mask2>]]]
  GET    /list[/<chain>]

  <target>   drop | accept | reject | snat | create | <user chain>
  <endpoint> IP[:PORT], 'any' as interface matches everything

  query parameters: expire=<n[s|m|h|d]>  wait=true  modify=insert|delete";

/// Shared state of both listeners.
pub struct ServerContext {
    pub cmd_channel: tokio::sync::mpsc::Sender<CommandMessage>,
    pub driver: Arc<Iptables>,
    pub registry: SharedRegistry,
    pub config: Arc<config::Internal>,
    pub log: slog::Logger,
}

fn http_resp(code: StatusCode, content: impl Into<String>) -> Response<Full<Bytes>> {
    let body = format!("{}\r\n", content.into());
    Response::builder()
        .status(code)
        .header(hyper::header::CONTENT_LENGTH, body.len())
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

fn auth_challenge() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header(
            hyper::header::WWW_AUTHENTICATE,
            format!("Basic realm=\"{}\"", AUTH_REALM),
        )
        .header(hyper::header::CONNECTION, "close")
        .body(Full::new(Bytes::from("\r\n")))
        .unwrap()
}

/// Decode rfc2617 Basic credentials from an Authorization header value.
fn basic_auth_credentials(header: &str) -> Option<(String, String)> {
    let (method, data) = header.split_once(' ')?;
    if !method.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

/// A rule endpoint conflicts with the whitelist when it is concrete and its
/// range touches any whitelisted range.
fn whitelist_conflict(addr: &str, whitelist: &[Ipv4Network]) -> bool {
    addr != ANY_ADDR && iputil::ip_in_list(addr, whitelist)
}

fn verb_to_modify(method: &Method) -> Option<Modify> {
    if *method == Method::PUT {
        Some(Modify::Insert)
    } else if *method == Method::DELETE {
        Some(Modify::Delete)
    } else if *method == Method::GET {
        Some(Modify::List)
    } else {
        None
    }
}

/// Save the live table through the platform's persistence script so rules
/// survive a reboot.
async fn persist_rules() -> Result<(), String> {
    if !std::path::Path::new(PERSIST_SCRIPT).is_file() {
        return Err(format!(
            "No {} script is installed. Please install it first!",
            PERSIST_SCRIPT
        ));
    }
    let status = tokio::process::Command::new(PERSIST_SCRIPT)
        .arg("save")
        .status()
        .await
        .map_err(|e| format!("Failed to launch {}: {}", PERSIST_SCRIPT, e))?;
    if !status.success() {
        return Err(format!("{} save exited with {}", PERSIST_SCRIPT, status));
    }
    Ok(())
}

/// Translate one request into a command, reject whitelist conflicts, and
/// acknowledge once the command is accepted onto the queue. The response is
/// an accept-ack; application happens asynchronously in the command worker.
async fn process(
    modify: Modify,
    req: &Request<Incoming>,
    ctx: &ServerContext,
) -> Response<Full<Bytes>> {
    let path = req.uri().path();
    let query = req.uri().query().unwrap_or("");

    let registry = ctx.registry.lock().unwrap().clone();
    let (command, directives) = match cmdparse::parse_command(path, query, &registry) {
        Ok(parsed) => parsed,
        Err(e) => {
            // a bad client request is not a server error
            slog::info!(ctx.log, "Rejected request"; "error" => e.to_string());
            return http_resp(StatusCode::BAD_REQUEST, format!("ERROR: {}", e));
        }
    };

    let (modify, rule) = match command {
        Command::Help => {
            if modify == Modify::List {
                return http_resp(StatusCode::OK, USAGE);
            }
            return http_resp(StatusCode::BAD_REQUEST, "ERROR: Unrecognized command.");
        }
        Command::List(chain) => {
            if modify != Modify::List {
                return http_resp(StatusCode::BAD_REQUEST, "ERROR: Unrecognized command.");
            }
            return match ctx.driver.read_simple_rules(chain.as_deref()).await {
                Ok(rules) => match serde_json::to_string(&rules) {
                    Ok(body) => http_resp(StatusCode::OK, body),
                    Err(e) => {
                        slog::error!(ctx.log, "Failed to serialize listing"; "error" => e.to_string());
                        http_resp(StatusCode::INTERNAL_SERVER_ERROR, "ERROR: Listing failed")
                    }
                },
                Err(e) => {
                    slog::error!(ctx.log, "Failed to list rules"; "error" => e.to_string());
                    http_resp(StatusCode::INTERNAL_SERVER_ERROR, "ERROR: Listing failed")
                }
            };
        }
        Command::Rule(rule) => {
            let effective = if modify == Modify::List {
                // GET carries a mutation only through the explicit override,
                // and only when the configuration allows it
                if !ctx.config.non_restful {
                    return http_resp(
                        StatusCode::BAD_REQUEST,
                        "ERROR: Unrecognized command. Non-restful disabled.",
                    );
                }
                match directives.modify {
                    Some(ModifyOverride::Insert) => Modify::Insert,
                    Some(ModifyOverride::Delete) => Modify::Delete,
                    None => {
                        return http_resp(
                            StatusCode::BAD_REQUEST,
                            "ERROR: Unrecognized command. Non-restful enabled, \
                             you need to provide modify parameter.",
                        )
                    }
                }
            } else {
                modify
            };
            (effective, rule)
        }
    };

    if whitelist_conflict(&rule.source, &ctx.config.whitelist)
        || whitelist_conflict(&rule.destination, &ctx.config.whitelist)
    {
        let msg = "Ignoring the request conflicting with the whitelist";
        slog::warn!(ctx.log, "{}", msg);
        return http_resp(StatusCode::BAD_REQUEST, format!("ERROR: {}", msg));
    }

    let ack = format!("{:?} {:?} {:?}", modify, rule, directives);
    let message = CommandMessage {
        modify,
        rule,
        directives,
    };
    slog::debug!(ctx.log, "Enqueueing command"; "command" => ack.clone());
    if let Err(e) = ctx.cmd_channel.try_send(message) {
        slog::error!(ctx.log, "Command queue unavailable"; "error" => e.to_string());
        return http_resp(
            StatusCode::INTERNAL_SERVER_ERROR,
            "ERROR: Command queue unavailable",
        );
    }

    if let Err(e) = persist_rules().await {
        slog::error!(ctx.log, "Failed to persist rules"; "error" => e.clone());
        return http_resp(StatusCode::INTERNAL_SERVER_ERROR, format!("ERROR: {}", e));
    }

    http_resp(StatusCode::OK, ack)
}

async fn handle_local(req: Request<Incoming>, ctx: Arc<ServerContext>) -> Response<Full<Bytes>> {
    match verb_to_modify(req.method()) {
        Some(modify) => process(modify, &req, &ctx).await,
        None => http_resp(StatusCode::METHOD_NOT_ALLOWED, "ERROR: Unsupported method"),
    }
}

async fn handle_outward(
    req: Request<Incoming>,
    peer: std::net::IpAddr,
    ctx: Arc<ServerContext>,
) -> Response<Full<Bytes>> {
    // authentication gates every verb
    let auth_header = req
        .headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    match basic_auth_credentials(auth_header) {
        Some((user, password))
            if user == ctx.config.auth_username && password == ctx.config.auth_password => {}
        Some(_) => {
            slog::warn!(ctx.log, "Authentication attempt with wrong credentials";
                        "peer" => peer.to_string());
            return auth_challenge();
        }
        None => return auth_challenge(),
    }

    // The kernel rules installed at startup should have blocked strangers
    // already; this check is defense in depth.
    if !iputil::ip_in_list(&peer.to_string(), &ctx.config.whitelist) {
        slog::error!(ctx.log,
                     "Request from client IP which is not authorized in the whitelist. \
                      It should have been blocked by firewall.";
                     "peer" => peer.to_string());
        return http_resp(StatusCode::FORBIDDEN, "");
    }

    match verb_to_modify(req.method()) {
        Some(modify) => process(modify, &req, &ctx).await,
        None => http_resp(StatusCode::METHOD_NOT_ALLOWED, "ERROR: Unsupported method"),
    }
}

/// Plaintext listener on loopback. No authentication; reachable only from
/// the host itself.
pub async fn run_local(
    ctx: Arc<ServerContext>,
    listener: tokio::net::TcpListener,
) -> anyhow::Result<()> {
    slog::info!(ctx.log, "Serving HTTP";
                "addr" => format!("{:?}", listener.local_addr()?));
    loop {
        let (stream, _peer) = listener.accept().await?;
        let ctx = Arc::clone(&ctx);
        tokio::task::spawn(async move {
            let log = ctx.log.clone();
            let service = service_fn(move |req| {
                let ctx = Arc::clone(&ctx);
                async move { Ok::<_, std::convert::Infallible>(handle_local(req, ctx).await) }
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                slog::debug!(log, "Connection ended"; "error" => e.to_string());
            }
        });
    }
}

/// TLS listener for remote controllers. Requires Basic auth and a
/// whitelisted peer address.
pub async fn run_outward(
    ctx: Arc<ServerContext>,
    listener: tokio::net::TcpListener,
    acceptor: tokio_rustls::TlsAcceptor,
) -> anyhow::Result<()> {
    slog::info!(ctx.log, "Serving HTTPS";
                "addr" => format!("{:?}", listener.local_addr()?));
    loop {
        let (stream, peer) = listener.accept().await?;
        let acceptor = acceptor.clone();
        let ctx = Arc::clone(&ctx);
        tokio::task::spawn(async move {
            let log = ctx.log.clone();
            match acceptor.accept(stream).await {
                Ok(tls_stream) => {
                    let peer_ip = peer.ip();
                    let service = service_fn(move |req| {
                        let ctx = Arc::clone(&ctx);
                        async move {
                            Ok::<_, std::convert::Infallible>(
                                handle_outward(req, peer_ip, ctx).await,
                            )
                        }
                    });
                    if let Err(e) = http1::Builder::new()
                        .serve_connection(TokioIo::new(tls_stream), service)
                        .await
                    {
                        slog::debug!(log, "Connection ended"; "error" => e.to_string());
                    }
                }
                Err(e) => {
                    slog::warn!(log, "TLS handshake failed";
                                "peer" => peer.to_string(), "error" => e.to_string());
                }
            }
        });
    }
}

/// Build the TLS acceptor from PEM certificate and key files.
pub fn tls_acceptor(
    certfile: &std::path::Path,
    keyfile: &std::path::Path,
) -> anyhow::Result<tokio_rustls::TlsAcceptor> {
    let mut cert_reader = std::io::BufReader::new(std::fs::File::open(certfile)?);
    let certs = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;
    let mut key_reader = std::io::BufReader::new(std::fs::File::open(keyfile)?);
    let key = rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| anyhow::anyhow!("No private key found in {}", keyfile.display()))?;
    let tls_config = tokio_rustls::rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(tokio_rustls::TlsAcceptor::from(Arc::new(tls_config)))
}
