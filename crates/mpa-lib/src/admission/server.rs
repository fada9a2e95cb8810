//! Webhook HTTP surface
//!
//! Routes `POST /mutate-pods` and `POST /validate-mpa`, served over rustls
//! with optional client certificate verification.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, routing::post, Json, Router};
use base64::{engine::general_purpose::STANDARD, Engine};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use k8s_openapi::api::core::v1::Pod;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::core::DynamicObject;
use rustls::server::AllowAnyAuthenticatedClient;
use serde_json::Value;
use rustls::{Certificate, PrivateKey, RootCertStore, ServerConfig};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use super::pod::PodHandler;
use super::validation::{default_patches, validate_mpa};
use crate::error::{Error, Result};
use crate::features::FeatureGates;
use crate::observability::{MpaMetrics, StructuredLogger};

const RESOURCE_POD: &str = "pod";
const RESOURCE_MPA: &str = "mpa";

/// Shared state of the webhook handlers
#[derive(Clone)]
pub struct AdmissionState {
    pub pods: Arc<PodHandler>,
    pub features: FeatureGates,
    pub metrics: MpaMetrics,
    pub logger: StructuredLogger,
}

pub fn create_router(state: AdmissionState) -> Router {
    Router::new()
        .route("/mutate-pods", post(mutate_pods))
        .route("/validate-mpa", post(validate_mpa_handler))
        .with_state(state)
}

fn admission_status(response: &AdmissionResponse) -> &'static str {
    if response.allowed {
        "admitted"
    } else {
        "rejected"
    }
}

/// The review sent back to the API server. The patch travels as a base64
/// string, which `AdmissionResponse` does not encode by itself.
fn review_body(mut response: AdmissionResponse) -> Json<Value> {
    let patch = response.patch.take();
    let mut body = serde_json::to_value(response.into_review()).unwrap_or_else(|e| {
        error!(error = %e, "Failed to serialize admission review");
        Value::Null
    });
    if let (Some(patch), Some(response)) = (
        patch,
        body.get_mut("response").and_then(Value::as_object_mut),
    ) {
        response.insert("patch".to_string(), Value::String(STANDARD.encode(patch)));
    }
    Json(body)
}

async fn mutate_pods(
    State(state): State<AdmissionState>,
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> Json<Value> {
    let started = Instant::now();
    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, "Failed to parse admission review");
            state
                .metrics
                .observe_admission(RESOURCE_POD, "error", started.elapsed().as_secs_f64(), false);
            return review_body(AdmissionResponse::invalid(e.to_string()));
        }
    };

    let (response, patched) = admit_pod(&state, &request).await;
    state.metrics.observe_admission(
        RESOURCE_POD,
        admission_status(&response),
        started.elapsed().as_secs_f64(),
        patched,
    );
    review_body(response)
}

async fn admit_pod(
    state: &AdmissionState,
    request: &AdmissionRequest<DynamicObject>,
) -> (AdmissionResponse, bool) {
    let allowed = AdmissionResponse::from(request);
    let Some(object) = request.object.as_ref() else {
        return (allowed, false);
    };
    let pod: Pod = match serde_json::to_value(object).and_then(serde_json::from_value) {
        Ok(pod) => pod,
        Err(e) => {
            warn!(uid = %request.uid, error = %e, "Cannot parse pod");
            return (allowed.deny(format!("failed to parse pod: {}", e)), false);
        }
    };
    let namespace = request.namespace.clone().unwrap_or_default();
    let pod_name = pod
        .metadata
        .name
        .clone()
        .or_else(|| pod.metadata.generate_name.clone())
        .unwrap_or_default();

    let patch = match state.pods.patch(pod, &namespace).await {
        Ok(patch) => patch,
        Err(e) => {
            error!(uid = %request.uid, pod = %pod_name, error = %e, "Failed to compute pod patch");
            return (allowed.deny(e.to_string()), false);
        }
    };
    let Some(mpa) = patch.mpa else {
        return (allowed, false);
    };

    let operations = patch.operations.len();
    match allowed.clone().with_patch(json_patch::Patch(patch.operations)) {
        Ok(response) => {
            state.logger.log_webhook_patch(&mpa, &pod_name, operations);
            (response, operations > 0)
        }
        Err(e) => {
            error!(uid = %request.uid, error = %e, "Failed to serialize patch");
            (allowed.deny(format!("patch serialization error: {}", e)), false)
        }
    }
}

async fn validate_mpa_handler(
    State(state): State<AdmissionState>,
    Json(review): Json<AdmissionReview<DynamicObject>>,
) -> Json<Value> {
    let started = Instant::now();
    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, "Failed to parse admission review");
            state
                .metrics
                .observe_admission(RESOURCE_MPA, "error", started.elapsed().as_secs_f64(), false);
            return review_body(AdmissionResponse::invalid(e.to_string()));
        }
    };

    let (response, patched) = admit_mpa(&state, &request);
    state.metrics.observe_admission(
        RESOURCE_MPA,
        admission_status(&response),
        started.elapsed().as_secs_f64(),
        patched,
    );
    review_body(response)
}

fn admit_mpa(
    state: &AdmissionState,
    request: &AdmissionRequest<DynamicObject>,
) -> (AdmissionResponse, bool) {
    let allowed = AdmissionResponse::from(request);
    if request.operation == Operation::Delete {
        return (allowed, false);
    }
    let Some(object) = request.object.as_ref() else {
        return (allowed, false);
    };
    let raw = match serde_json::to_value(object) {
        Ok(raw) => raw,
        Err(e) => return (allowed.deny(format!("cannot parse MPA object: {}", e)), false),
    };
    let is_create = request.operation == Operation::Create;
    let mpa = match validate_mpa(&raw, is_create, state.features) {
        Ok(mpa) => mpa,
        Err(e) => {
            info!(uid = %request.uid, name = %request.name, error = %e, "Rejected MPA object");
            return (allowed.deny(e.to_string()), false);
        }
    };

    let patches = default_patches(&mpa);
    if patches.is_empty() {
        return (allowed, false);
    }
    debug!(name = %request.name, "Defaulting updateMode to Auto");
    match allowed.clone().with_patch(json_patch::Patch(patches)) {
        Ok(response) => (response, true),
        Err(e) => (allowed.deny(format!("patch serialization error: {}", e)), false),
    }
}

fn read_pem(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path)
        .map_err(|e| Error::tls(format!("cannot open {}: {}", path.display(), e)))?;
    Ok(BufReader::new(file))
}

fn load_certs(path: &Path) -> Result<Vec<Certificate>> {
    let certs = rustls_pemfile::certs(&mut read_pem(path)?)
        .map_err(|e| Error::tls(format!("cannot parse {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(Error::tls(format!("no certificates in {}", path.display())));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_key(path: &Path) -> Result<PrivateKey> {
    let items = rustls_pemfile::read_all(&mut read_pem(path)?)
        .map_err(|e| Error::tls(format!("cannot parse {}: {}", path.display(), e)))?;
    items
        .into_iter()
        .find_map(|item| match item {
            rustls_pemfile::Item::PKCS8Key(key)
            | rustls_pemfile::Item::RSAKey(key)
            | rustls_pemfile::Item::ECKey(key) => Some(PrivateKey(key)),
            _ => None,
        })
        .ok_or_else(|| Error::tls(format!("no private key in {}", path.display())))
}

/// Server TLS configuration. With `client_ca_file` set, clients must present
/// a certificate signed by that CA.
pub fn load_tls_config(
    cert_file: &Path,
    key_file: &Path,
    client_ca_file: Option<&Path>,
) -> Result<ServerConfig> {
    let certs = load_certs(cert_file)?;
    let key = load_key(key_file)?;
    let builder = ServerConfig::builder().with_safe_defaults();
    let config = match client_ca_file {
        Some(ca_file) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca_file)? {
                roots
                    .add(&cert)
                    .map_err(|e| Error::tls(format!("invalid client CA: {:?}", e)))?;
            }
            builder
                .with_client_cert_verifier(AllowAnyAuthenticatedClient::new(roots).boxed())
                .with_single_cert(certs, key)
        }
        None => builder.with_no_client_auth().with_single_cert(certs, key),
    };
    config.map_err(|e| Error::tls(format!("invalid certificate or key: {}", e)))
}

/// Serves `router` over TLS until `shutdown` fires
pub async fn serve_tls(
    addr: SocketAddr,
    router: Router,
    tls: ServerConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let acceptor = TlsAcceptor::from(Arc::new(tls));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::config(format!("cannot bind {}: {}", addr, e)))?;
    info!(address = %addr, "Admission webhook listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let router = router.clone();
                tokio::spawn(async move {
                    let stream = match acceptor.accept(stream).await {
                        Ok(stream) => stream,
                        Err(e) => {
                            debug!(peer = %peer, error = %e, "TLS handshake failed");
                            return;
                        }
                    };
                    let service = TowerToHyperService::new(router);
                    if let Err(e) = Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        debug!(peer = %peer, error = %e, "Connection closed with error");
                    }
                });
            }
            _ = shutdown.recv() => {
                info!("Admission webhook shutting down");
                break;
            }
        }
    }
    Ok(())
}
