//! Kubernetes REST client over `reqwest`, with exec streams over websocket.

use async_trait::async_trait;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{Connector, WebSocketStream};
use tracing::{debug, info};
use url::Url;

use super::protocol::{self, Frame};
use super::types::{ObjectList, Status};
use super::{
    Cluster, ClusterResult, ConfigMap, DeleteOptions, ExecChannel, ExecEvent, ExecInput,
    ExecOptions, ExitStatus, Namespace, Pod,
};
use crate::config::Config;
use crate::error::ClusterError;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const EXEC_BUFFER: usize = 64;

/// Where the API server lives and how to authenticate to it.
#[derive(Debug, Clone)]
pub struct ClusterCredentials {
    pub server: Url,
    pub ca_pem: Option<Vec<u8>>,
    pub token: Option<String>,
    pub client_cert_pem: Option<Vec<u8>>,
    pub client_key_pem: Option<Vec<u8>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct Kubeconfig {
    #[serde(default)]
    current_context: String,
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    users: Vec<NamedUser>,
    #[serde(default)]
    contexts: Vec<NamedContext>,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: KubeconfigCluster,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct KubeconfigCluster {
    server: String,
    #[serde(default)]
    certificate_authority_data: Option<String>,
    #[serde(default)]
    certificate_authority: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct NamedUser {
    name: String,
    #[serde(default)]
    user: KubeconfigUser,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct KubeconfigUser {
    #[serde(default)]
    token: Option<String>,
    #[serde(default, rename = "tokenFile")]
    token_file: Option<PathBuf>,
    #[serde(default)]
    client_certificate_data: Option<String>,
    #[serde(default)]
    client_key_data: Option<String>,
    #[serde(default)]
    client_certificate: Option<PathBuf>,
    #[serde(default)]
    client_key: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct NamedContext {
    name: String,
    context: KubeconfigContext,
}

#[derive(Debug, Deserialize)]
struct KubeconfigContext {
    cluster: String,
    #[serde(default)]
    user: String,
}

fn config_err(what: impl std::fmt::Display) -> ClusterError {
    ClusterError::Config(what.to_string())
}

fn read_file(path: &Path) -> ClusterResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| config_err(format!("read {}: {}", path.display(), e)))
}

fn decode_b64(field: &str, data: &str) -> ClusterResult<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| config_err(format!("{}: {}", field, e)))
}

fn parse_server(raw: &str) -> ClusterResult<Url> {
    let mut url = Url::parse(raw).map_err(|e| config_err(format!("server {:?}: {}", raw, e)))?;
    // Keep any path prefix when joining API paths onto it.
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Inline data wins over a file reference; relative paths resolve against `base`.
fn data_or_file(
    field: &str,
    data: Option<&str>,
    file: Option<&Path>,
    base: &Path,
) -> ClusterResult<Option<Vec<u8>>> {
    if let Some(data) = data {
        return decode_b64(field, data).map(Some);
    }
    match file {
        Some(path) => read_file(&base.join(path)).map(Some),
        None => Ok(None),
    }
}

impl ClusterCredentials {
    /// Credentials of the pod's service account.
    pub fn in_cluster() -> ClusterResult<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| config_err("KUBERNETES_SERVICE_HOST not set"))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
        let host = if host.contains(':') {
            format!("[{}]", host)
        } else {
            host
        };
        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        let token = String::from_utf8_lossy(&read_file(&dir.join("token"))?)
            .trim()
            .to_string();
        Ok(Self {
            server: parse_server(&format!("https://{}:{}", host, port))?,
            ca_pem: Some(read_file(&dir.join("ca.crt"))?),
            token: Some(token),
            client_cert_pem: None,
            client_key_pem: None,
        })
    }

    pub fn from_kubeconfig_file(path: &Path) -> ClusterResult<Self> {
        let raw = read_file(path)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_kubeconfig(&String::from_utf8_lossy(&raw), base)
    }

    /// Resolve the current context of a kubeconfig document.
    pub fn from_kubeconfig(yaml: &str, base: &Path) -> ClusterResult<Self> {
        let kubeconfig: Kubeconfig = serde_yaml::from_str(yaml).map_err(config_err)?;

        let context = if kubeconfig.current_context.is_empty() {
            kubeconfig.contexts.first()
        } else {
            kubeconfig
                .contexts
                .iter()
                .find(|c| c.name == kubeconfig.current_context)
        }
        .ok_or_else(|| config_err("kubeconfig has no usable context"))?;

        let cluster = kubeconfig
            .clusters
            .iter()
            .find(|c| c.name == context.context.cluster)
            .map(|c| &c.cluster)
            .ok_or_else(|| config_err(format!("cluster {} not in kubeconfig", context.context.cluster)))?;
        let default_user = KubeconfigUser::default();
        let user = kubeconfig
            .users
            .iter()
            .find(|u| u.name == context.context.user)
            .map(|u| &u.user)
            .unwrap_or(&default_user);

        let token = match (&user.token, &user.token_file) {
            (Some(token), _) => Some(token.trim().to_string()),
            (None, Some(file)) => Some(
                String::from_utf8_lossy(&read_file(&base.join(file))?)
                    .trim()
                    .to_string(),
            ),
            (None, None) => None,
        };

        Ok(Self {
            server: parse_server(&cluster.server)?,
            ca_pem: data_or_file(
                "certificate-authority-data",
                cluster.certificate_authority_data.as_deref(),
                cluster.certificate_authority.as_deref(),
                base,
            )?,
            token,
            client_cert_pem: data_or_file(
                "client-certificate-data",
                user.client_certificate_data.as_deref(),
                user.client_certificate.as_deref(),
                base,
            )?,
            client_key_pem: data_or_file(
                "client-key-data",
                user.client_key_data.as_deref(),
                user.client_key.as_deref(),
                base,
            )?,
        })
    }

    /// Explicit kubeconfig, else in-cluster, else `$KUBECONFIG`, else `~/.kube/config`.
    pub fn discover(explicit: Option<&Path>) -> ClusterResult<Self> {
        if let Some(path) = explicit {
            return Self::from_kubeconfig_file(path);
        }
        if std::env::var_os("KUBERNETES_SERVICE_HOST").is_some() {
            return Self::in_cluster();
        }
        let path = std::env::var_os("KUBECONFIG")
            .and_then(|v| std::env::split_paths(&v).next())
            .or_else(|| std::env::var_os("HOME").map(|home| Path::new(&home).join(".kube/config")))
            .ok_or_else(|| config_err("no kubeconfig found"))?;
        Self::from_kubeconfig_file(&path)
    }

    /// TLS settings for the exec websocket. `None` means the platform roots suffice.
    fn websocket_tls(&self) -> ClusterResult<Option<Arc<rustls::ClientConfig>>> {
        if self.ca_pem.is_none() && self.client_cert_pem.is_none() {
            return Ok(None);
        }

        let mut roots = rustls::RootCertStore::empty();
        if let Some(ca) = &self.ca_pem {
            for cert in rustls_pemfile::certs(&mut ca.as_slice()) {
                let cert = cert.map_err(|e| config_err(format!("cluster CA: {}", e)))?;
                roots
                    .add(cert)
                    .map_err(|e| config_err(format!("cluster CA: {}", e)))?;
            }
        }

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let builder = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(config_err)?
            .with_root_certificates(roots);

        let config = match (&self.client_cert_pem, &self.client_key_pem) {
            (Some(cert), Some(key)) => {
                let chain = rustls_pemfile::certs(&mut cert.as_slice())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| config_err(format!("client certificate: {}", e)))?;
                let key = rustls_pemfile::private_key(&mut key.as_slice())
                    .map_err(|e| config_err(format!("client key: {}", e)))?
                    .ok_or_else(|| config_err("client key: no private key found"))?;
                builder
                    .with_client_auth_cert(chain, key)
                    .map_err(config_err)?
            }
            _ => builder.with_no_client_auth(),
        };
        Ok(Some(Arc::new(config)))
    }
}

/// [`Cluster`] implementation talking to a real API server.
pub struct KubeClient {
    http: reqwest::Client,
    server: Url,
    token: Option<String>,
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl KubeClient {
    /// Build a client. `timeout` bounds every REST call.
    pub fn new(credentials: ClusterCredentials, timeout: Duration) -> ClusterResult<Self> {
        let mut builder = reqwest::Client::builder().use_rustls_tls().timeout(timeout);
        if let Some(ca) = &credentials.ca_pem {
            for cert in reqwest::Certificate::from_pem_bundle(ca)? {
                builder = builder.add_root_certificate(cert);
            }
        }
        if let (Some(cert), Some(key)) = (&credentials.client_cert_pem, &credentials.client_key_pem) {
            let mut pem = cert.clone();
            pem.push(b'\n');
            pem.extend_from_slice(key);
            builder = builder.identity(reqwest::Identity::from_pem(&pem)?);
        }

        let tls = credentials.websocket_tls()?;
        info!(server = %credentials.server, "Kubernetes client configured");
        Ok(Self {
            http: builder.build()?,
            server: credentials.server,
            token: credentials.token,
            tls,
        })
    }

    pub fn from_config(config: &Config) -> ClusterResult<Self> {
        let credentials = ClusterCredentials::discover(config.kubeconfig.as_deref())?;
        Self::new(credentials, config.exec_timeout)
    }

    fn url(&self, path: &str) -> ClusterResult<Url> {
        self.server.join(path).map_err(config_err)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let request = self.http.request(method, url);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        kind: &'static str,
        name: &str,
    ) -> ClusterResult<T> {
        let response = check(request.send().await?, kind, name).await?;
        Ok(response.json().await?)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, kind: &'static str, name: &str) -> ClusterResult<T> {
        let request = self.request(Method::GET, self.url(path)?);
        self.fetch(request, kind, name).await
    }

    async fn list<T: DeserializeOwned>(
        &self,
        path: &str,
        selector: Option<&str>,
        kind: &'static str,
    ) -> ClusterResult<Vec<T>> {
        let mut request = self.request(Method::GET, self.url(path)?);
        if let Some(selector) = selector.filter(|s| !s.is_empty()) {
            request = request.query(&[("labelSelector", selector)]);
        }
        let list: ObjectList<T> = self.fetch(request, kind, path).await?;
        Ok(list.items)
    }

    async fn create<B, T>(&self, path: &str, body: &B, kind: &'static str, name: &str) -> ClusterResult<T>
    where
        B: serde::Serialize + Sync,
        T: DeserializeOwned,
    {
        let request = self.request(Method::POST, self.url(path)?).json(body);
        self.fetch(request, kind, name).await
    }

    async fn delete(
        &self,
        path: &str,
        options: &DeleteOptions,
        kind: &'static str,
        name: &str,
    ) -> ClusterResult<()> {
        let request = self.request(Method::DELETE, self.url(path)?).json(options);
        check(request.send().await?, kind, name).await?;
        Ok(())
    }
}

/// Map a non-success response to a [`ClusterError`].
async fn check(response: Response, kind: &'static str, name: &str) -> ClusterResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Status>(&body)
        .ok()
        .map(|s| s.message)
        .filter(|m| !m.is_empty())
        .unwrap_or(body);
    Err(match status {
        StatusCode::NOT_FOUND => ClusterError::NotFound {
            kind,
            name: name.to_string(),
        },
        StatusCode::CONFLICT => ClusterError::AlreadyExists {
            kind,
            name: name.to_string(),
        },
        _ => ClusterError::Api {
            status: status.as_u16(),
            message,
        },
    })
}

fn flag(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

#[async_trait]
impl Cluster for KubeClient {
    async fn create_namespace(&self, namespace: &Namespace) -> ClusterResult<Namespace> {
        self.create("api/v1/namespaces", namespace, "namespace", &namespace.metadata.name)
            .await
    }

    async fn list_namespaces(&self, selector: Option<&str>) -> ClusterResult<Vec<Namespace>> {
        self.list("api/v1/namespaces", selector, "namespace").await
    }

    async fn delete_namespace(&self, name: &str, options: &DeleteOptions) -> ClusterResult<()> {
        self.delete(&format!("api/v1/namespaces/{}", name), options, "namespace", name)
            .await
    }

    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap) -> ClusterResult<ConfigMap> {
        let path = format!("api/v1/namespaces/{}/configmaps", namespace);
        self.create(&path, config_map, "configmap", &config_map.metadata.name)
            .await
    }

    async fn list_config_maps(&self, namespace: &str, selector: &str) -> ClusterResult<Vec<ConfigMap>> {
        let path = format!("api/v1/namespaces/{}/configmaps", namespace);
        self.list(&path, Some(selector), "configmap").await
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        let path = format!("api/v1/namespaces/{}/configmaps/{}", namespace, name);
        self.delete(&path, &DeleteOptions::default(), "configmap", name)
            .await
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> ClusterResult<Pod> {
        let path = format!("api/v1/namespaces/{}/pods", namespace);
        self.create(&path, pod, "pod", &pod.metadata.name).await
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> ClusterResult<Pod> {
        let path = format!("api/v1/namespaces/{}/pods/{}", namespace, name);
        self.get(&path, "pod", name).await
    }

    async fn list_pods(&self, namespace: &str, selector: Option<&str>) -> ClusterResult<Vec<Pod>> {
        let path = format!("api/v1/namespaces/{}/pods", namespace);
        self.list(&path, selector, "pod").await
    }

    async fn delete_pod(&self, namespace: &str, name: &str, options: &DeleteOptions) -> ClusterResult<()> {
        let path = format!("api/v1/namespaces/{}/pods/{}", namespace, name);
        self.delete(&path, options, "pod", name).await
    }

    async fn exec(&self, namespace: &str, pod: &str, options: &ExecOptions) -> ClusterResult<ExecChannel> {
        let mut url = self.url(&format!("api/v1/namespaces/{}/pods/{}/exec", namespace, pod))?;
        {
            let mut query = url.query_pairs_mut();
            for arg in &options.command {
                query.append_pair("command", arg);
            }
            if let Some(container) = &options.container {
                query.append_pair("container", container);
            }
            query
                .append_pair("stdin", flag(options.stdin))
                .append_pair("stdout", "true")
                .append_pair("stderr", flag(!options.tty))
                .append_pair("tty", flag(options.tty));
        }
        let scheme = if url.scheme() == "http" { "ws" } else { "wss" };
        url.set_scheme(scheme)
            .map_err(|_| config_err(format!("cannot use {} for websocket", url)))?;

        let mut request = url.as_str().into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(protocol::SUBPROTOCOL),
        );
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(config_err)?;
            headers.insert(header::AUTHORIZATION, value);
        }

        let connector = self.tls.clone().map(Connector::Rustls);
        let (socket, _) = tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector)
            .await
            .map_err(|e| match e {
                tungstenite::Error::Http(response) if response.status().as_u16() == 404 => {
                    ClusterError::NotFound {
                        kind: "pod",
                        name: pod.to_string(),
                    }
                }
                other => other.into(),
            })?;
        debug!(namespace, pod, command = ?options.command, tty = options.tty, "Exec stream opened");

        let (input_tx, input_rx) = mpsc::channel(EXEC_BUFFER);
        let (event_tx, event_rx) = mpsc::channel(EXEC_BUFFER);
        tokio::spawn(pump(socket, input_rx, event_tx));

        Ok(ExecChannel {
            input: input_tx,
            events: event_rx,
        })
    }
}

/// Reported when the stream closes before the API server sent a status frame.
const STREAM_CUT: &str = "exec stream closed before the command reported its exit status";

/// Shuttle frames between the websocket and the channel pair until the command ends.
async fn pump<S>(
    socket: WebSocketStream<S>,
    mut input: mpsc::Receiver<ExecInput>,
    events: mpsc::Sender<ExecEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = socket.split();
    let mut input_open = true;
    let mut status = None;

    loop {
        tokio::select! {
            _ = events.closed() => break,
            msg = input.recv(), if input_open => {
                let frame = match msg {
                    Some(ExecInput::Stdin(data)) => protocol::encode_stdin(&data),
                    Some(ExecInput::Resize(size)) => protocol::encode_resize(size),
                    None => {
                        input_open = false;
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Binary(frame)).await {
                    status = Some(ExitStatus::failure(None, e.to_string()));
                    break;
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Binary(data))) => {
                    let event = match protocol::decode(&data) {
                        Some(Frame::Stdout(bytes)) => ExecEvent::Stdout(bytes),
                        Some(Frame::Stderr(bytes)) => ExecEvent::Stderr(bytes),
                        Some(Frame::Status(exit)) => {
                            status = Some(exit);
                            continue;
                        }
                        None => continue,
                    };
                    if events.send(event).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    status.get_or_insert_with(|| ExitStatus::failure(None, e.to_string()));
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
    let status = status.unwrap_or_else(|| ExitStatus::failure(None, STREAM_CUT));
    let _ = events.send(ExecEvent::Exit(status)).await;
}
