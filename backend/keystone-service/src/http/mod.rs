//! Dual HTTP(S) servers.
//!
//! Two independently configured listeners share the process state but get
//! separate router trees, middleware stacks, and rate-limit buckets: the
//! public listener serves `/service/**` (strict JSON), `/browser/**`
//! (CSRF + CSP + forms), and the discovery documents; the admin listener is
//! loopback-only. TLS is terminated here when configured (with optional
//! client-certificate request for mTLS client auth), otherwise the listener
//! speaks plain TCP behind an external terminator.

pub mod admin;
pub mod browser;
pub mod middleware;
pub mod public;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::error_handling::HandleErrorLayer;
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tower::{BoxError, ServiceBuilder, ServiceExt};
use tower_http::catch_panic::CatchPanicLayer;

use crate::config::TlsSettings;
use crate::error::ServiceError;
use crate::AppState;
use middleware::{ClientAddr, PeerCerts};

/// Drain deadline applied after a shutdown signal before connections are
/// aborted.
const DRAIN_DEADLINE_SECS: u64 = 15;

/// Assemble the public router.
pub fn public_router(state: AppState) -> Router {
    let service = public::service_routes(state.clone());
    let browser = browser::routes(state.clone());

    // Canonical paths and their middleware-group aliases route to the same
    // handlers.
    let router = Router::new()
        .route(
            "/.well-known/openid-configuration",
            axum::routing::get(public::discovery),
        )
        .route(
            "/.well-known/jwks.json",
            axum::routing::get(public::jwks),
        )
        .nest("/service", service.clone())
        .merge(service)
        .nest("/browser", browser.clone())
        .merge(browser);

    let deadline = state.settings.request.deadline_secs;
    router
        .layer(
            ServiceBuilder::new()
                .layer(CatchPanicLayer::custom(
                    |err: Box<dyn std::any::Any + Send + 'static>| {
                        middleware::panic_response(err)
                    },
                ))
                .layer(HandleErrorLayer::new(|_: BoxError| async {
                    ServiceError::Timeout
                }))
                .layer(tower::timeout::TimeoutLayer::new(Duration::from_secs(
                    deadline,
                ))),
        )
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::request_telemetry,
        ))
        .with_state(state)
}

/// Assemble the admin router (loopback listener).
pub fn admin_router(state: AppState) -> Router {
    admin::routes(state.clone())
        .layer(CatchPanicLayer::custom(
            |err: Box<dyn std::any::Any + Send + 'static>| middleware::panic_response(err),
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::request_telemetry,
        ))
        .with_state(state)
}

/// Serve a router on `addr`, with TLS when configured. Runs until the stop
/// signal flips, then drains in-flight connections within a bounded
/// deadline.
pub async fn serve(
    addr: &str,
    router: Router,
    tls: Option<&TlsSettings>,
    mut stop: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let acceptor = match tls {
        Some(tls) => Some(TlsAcceptor::from(Arc::new(build_tls_config(tls)?))),
        None => None,
    };
    tracing::info!(addr, tls = acceptor.is_some(), "listener started");

    let mut connections: JoinSet<()> = JoinSet::new();
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        tracing::debug!(error = %err, "accept failed");
                        continue;
                    }
                };
                let router = router.clone();
                let acceptor = acceptor.clone();
                connections.spawn(async move {
                    match acceptor {
                        Some(acceptor) => {
                            let tls_stream = match acceptor.accept(stream).await {
                                Ok(tls_stream) => tls_stream,
                                Err(err) => {
                                    tracing::debug!(error = %err, "TLS handshake failed");
                                    return;
                                }
                            };
                            let peer_certs = PeerCerts(Arc::new(
                                tls_stream
                                    .get_ref()
                                    .1
                                    .peer_certificates()
                                    .map(|certs| {
                                        certs.iter().map(|c| c.as_ref().to_vec()).collect()
                                    })
                                    .unwrap_or_default(),
                            ));
                            serve_connection(TokioIo::new(tls_stream), router, peer_addr, peer_certs)
                                .await;
                        }
                        None => {
                            serve_connection(
                                TokioIo::new(stream),
                                router,
                                peer_addr,
                                PeerCerts::default(),
                            )
                            .await;
                        }
                    }
                });
            }
        }
    }

    // Stop accepting; drain with a bounded deadline, then abort stragglers.
    tracing::info!(addr, in_flight = connections.len(), "listener draining");
    let drain = async {
        while connections.join_next().await.is_some() {}
    };
    if tokio::time::timeout(Duration::from_secs(DRAIN_DEADLINE_SECS), drain)
        .await
        .is_err()
    {
        tracing::warn!(addr, "drain deadline exceeded, aborting connections");
        connections.shutdown().await;
    }
    Ok(())
}

async fn serve_connection<I>(
    io: TokioIo<I>,
    router: Router,
    peer_addr: std::net::SocketAddr,
    peer_certs: PeerCerts,
) where
    I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let hyper_service = hyper::service::service_fn(move |mut request: hyper::Request<hyper::body::Incoming>| {
        request.extensions_mut().insert(ClientAddr(peer_addr));
        request.extensions_mut().insert(peer_certs.clone());
        router.clone().oneshot(request)
    });

    if let Err(err) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(io, hyper_service)
        .await
    {
        tracing::debug!(error = %err, "connection error");
    }
}

fn build_tls_config(tls: &TlsSettings) -> anyhow::Result<rustls::ServerConfig> {
    let cert_pem = std::fs::read(&tls.cert_file)
        .with_context(|| format!("failed to read {}", tls.cert_file))?;
    let key_pem = std::fs::read(&tls.key_file)
        .with_context(|| format!("failed to read {}", tls.key_file))?;

    let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .context("invalid certificate file")?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .context("invalid key file")?
        .context("no private key found")?;

    let builder = rustls::ServerConfig::builder();
    let config = if tls.request_client_cert {
        // Clients may present a certificate for mTLS authentication; the
        // registration match and revocation check happen at the client-auth
        // layer, so unauthenticated connections are still accepted here.
        let roots = Arc::new(load_client_roots(tls)?);
        let verifier = rustls::server::WebPkiClientVerifier::builder(roots)
            .allow_unauthenticated()
            .build()
            .context("failed to build client certificate verifier")?;
        builder.with_client_cert_verifier(verifier)
    } else {
        builder.with_no_client_auth()
    }
    .with_single_cert(certs, key)
    .context("invalid certificate/key pair")?;

    Ok(config)
}

fn load_client_roots(tls: &TlsSettings) -> anyhow::Result<rustls::RootCertStore> {
    let mut roots = rustls::RootCertStore::empty();
    if let Some(path) = &tls.client_ca_file {
        let pem = std::fs::read(path).with_context(|| format!("failed to read {path}"))?;
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            roots
                .add(cert.context("invalid CA certificate")?)
                .context("failed to add CA certificate")?;
        }
    }
    Ok(roots)
}
