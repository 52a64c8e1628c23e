use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientInfo {
    pub ip: Option<String>,
    pub isp: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Server {
    #[serde(default)]
    pub url: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub sponsor: String,
    #[serde(default)]
    pub distance: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SpeedResult {
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub latency_ms: f64,
    pub isp: Option<String>,
    pub server: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ClientInfo,
    Servers,
    Latency,
    Download,
    Upload,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::ClientInfo => "client info",
            Stage::Servers => "server list",
            Stage::Latency => "latency",
            Stage::Download => "download",
            Stage::Upload => "upload",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutSource {
    Stage,
    Pipeline,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected response: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum SpeedtestError {
    #[error("{stage} stage timed out ({fired:?} deadline)")]
    Timeout { stage: Stage, fired: TimeoutSource },
    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: ProviderError,
    },
    #[error("no suitable server found")]
    NoCandidate,
}

impl SpeedtestError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Timeout {
                stage: Stage::ClientInfo,
                ..
            } => "⚠️ Speedtest: timed out while fetching network information",
            Self::Stage {
                stage: Stage::ClientInfo,
                ..
            } => "⚠️ Speedtest: failed to fetch network information",
            Self::Timeout {
                stage: Stage::Servers,
                ..
            }
            | Self::Stage {
                stage: Stage::Servers,
                ..
            } => "⚠️ Speedtest: failed to fetch the server list",
            Self::NoCandidate => "⚠️ Speedtest: no suitable server found",
            Self::Timeout {
                stage: Stage::Latency,
                ..
            }
            | Self::Stage {
                stage: Stage::Latency,
                ..
            } => "⚠️ Speedtest: latency test failed",
            Self::Timeout {
                stage: Stage::Download,
                ..
            }
            | Self::Stage {
                stage: Stage::Download,
                ..
            } => "⚠️ Speedtest: download test failed",
            Self::Timeout {
                stage: Stage::Upload,
                ..
            }
            | Self::Stage {
                stage: Stage::Upload,
                ..
            } => "⚠️ Speedtest: upload test failed",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SpeedtestLimits {
    pub context_timeout: Duration,
    pub stage_timeout: Duration,
    pub pipeline_timeout: Duration,
}

impl From<&crate::config::SpeedtestConfig> for SpeedtestLimits {
    fn from(cfg: &crate::config::SpeedtestConfig) -> Self {
        Self {
            context_timeout: Duration::from_secs(cfg.context_timeout_secs),
            stage_timeout: Duration::from_secs(cfg.stage_timeout_secs),
            pipeline_timeout: Duration::from_secs(cfg.pipeline_timeout_secs),
        }
    }
}

#[async_trait]
pub trait SpeedProvider: Send + Sync {
    async fn client_info(&self) -> Result<ClientInfo, ProviderError>;
    async fn servers(&self) -> Result<Vec<Server>, ProviderError>;
    async fn latency(&self, server: &Server) -> Result<Duration, ProviderError>;
    async fn download(&self, server: &Server) -> Result<f64, ProviderError>;
    /// Returns throughput in Mbit/s.
    async fn upload(&self, server: &Server) -> Result<f64, ProviderError>;
}

pub async fn run_speedtest(
    provider: &dyn SpeedProvider,
    limits: SpeedtestLimits,
) -> Result<SpeedResult, SpeedtestError> {
    let deadline = Instant::now() + limits.pipeline_timeout;

    let client = run_stage(
        Stage::ClientInfo,
        deadline,
        limits.context_timeout,
        provider.client_info(),
    )
    .await?;
    debug!(isp = ?client.isp, "client info fetched");

    let servers = run_stage(
        Stage::Servers,
        deadline,
        limits.pipeline_timeout,
        provider.servers(),
    )
    .await?;
    let server = select_server(servers).ok_or(SpeedtestError::NoCandidate)?;
    info!(server_id = %server.id, server = %server.name, "speedtest server selected");

    let latency = run_stage(
        Stage::Latency,
        deadline,
        limits.stage_timeout,
        provider.latency(&server),
    )
    .await?;
    let download_mbps = run_stage(
        Stage::Download,
        deadline,
        limits.stage_timeout,
        provider.download(&server),
    )
    .await?;
    let upload_mbps = run_stage(
        Stage::Upload,
        deadline,
        limits.stage_timeout,
        provider.upload(&server),
    )
    .await?;

    Ok(SpeedResult {
        download_mbps,
        upload_mbps,
        latency_ms: latency.as_secs_f64() * 1000.0,
        isp: client.isp.filter(|s| !s.trim().is_empty()),
        server: server_label(&server),
    })
}

pub async fn run_stage<T, F>(
    stage: Stage,
    pipeline_deadline: Instant,
    stage_timeout: Duration,
    fut: F,
) -> Result<T, SpeedtestError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    let stage_deadline = Instant::now() + stage_timeout;
    let (deadline, fired) = if stage_deadline < pipeline_deadline {
        (stage_deadline, TimeoutSource::Stage)
    } else {
        (pipeline_deadline, TimeoutSource::Pipeline)
    };

    match tokio::time::timeout_at(deadline, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(SpeedtestError::Stage { stage, source }),
        Err(_elapsed) => Err(SpeedtestError::Timeout { stage, fired }),
    }
}

pub fn select_server(mut servers: Vec<Server>) -> Option<Server> {
    servers.retain(|s| !s.url.trim().is_empty());
    servers.sort_by(|a, b| {
        let da = a.distance.unwrap_or(f64::INFINITY);
        let db = b.distance.unwrap_or(f64::INFINITY);
        da.total_cmp(&db)
    });
    servers.into_iter().next()
}

fn server_label(server: &Server) -> Option<String> {
    let parts = [&server.name, &server.country]
        .into_iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();
    if parts.is_empty() {
        return None;
    }
    let mut label = parts.join(", ");
    if !server.sponsor.trim().is_empty() {
        label.push_str(&format!(" ({})", server.sponsor.trim()));
    }
    if !server.id.trim().is_empty() {
        label.push_str(&format!(" • ID {}", server.id.trim()));
    }
    Some(label)
}

pub fn format_throughput(mbps: f64) -> String {
    if mbps >= 1000.0 {
        format!("{:.2} Gbit/s", mbps / 1000.0)
    } else if mbps >= 1.0 {
        format!("{:.2} Mbit/s", mbps)
    } else {
        format!("{:.0} kbit/s", mbps * 1000.0)
    }
}

pub fn format_speedtest(result: &SpeedResult, status: &str) -> String {
    format!(
        "🚀 Speedtest\n\n\
         ⬇️ Download: {}\n\
         ⬆️ Upload:   {}\n\
         🕒 Ping:     {:.1} ms\n\
         🏷 ISP:      {}\n\
         🗺 Server:   {}\n\
         ✅ Status:   {status}",
        format_throughput(result.download_mbps),
        format_throughput(result.upload_mbps),
        result.latency_ms,
        result.isp.as_deref().unwrap_or("n/a"),
        result.server.as_deref().unwrap_or("n/a"),
    )
}

const CONFIG_URL: &str = "https://www.speedtest.net/speedtest-config.php";
const SERVERS_URL: &str =
    "https://www.speedtest.net/api/js/servers?engine=js&https_functional=true&limit=10";
const LATENCY_SAMPLES: usize = 3;
const DOWNLOAD_SIZES: [u32; 3] = [750, 1000, 1500];
const UPLOAD_BYTES: usize = 4_000_000;

pub struct OoklaProvider {
    client: Client,
}

impl OoklaProvider {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SpeedProvider for OoklaProvider {
    async fn client_info(&self) -> Result<ClientInfo, ProviderError> {
        let body = self
            .client
            .get(CONFIG_URL)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        parse_client_info(&body)
    }

    async fn servers(&self) -> Result<Vec<Server>, ProviderError> {
        let servers = self
            .client
            .get(SERVERS_URL)
            .send()
            .await?
            .error_for_status()?
            .json::<Vec<Server>>()
            .await?;
        Ok(servers)
    }

    async fn latency(&self, server: &Server) -> Result<Duration, ProviderError> {
        let url = endpoint(&server.url, "latency.txt")?;
        let mut best: Option<Duration> = None;
        for _ in 0..LATENCY_SAMPLES {
            let start = std::time::Instant::now();
            self.client
                .get(url.clone())
                .send()
                .await?
                .error_for_status()?
                .bytes()
                .await?;
            let rtt = start.elapsed();
            best = Some(best.map_or(rtt, |b| b.min(rtt)));
        }
        best.ok_or_else(|| ProviderError::Malformed("no latency samples".to_string()))
    }

    async fn download(&self, server: &Server) -> Result<f64, ProviderError> {
        let start = std::time::Instant::now();
        let mut total_bytes = 0_usize;
        for size in DOWNLOAD_SIZES {
            let url = endpoint(&server.url, &format!("random{size}x{size}.jpg"))?;
            let bytes = self
                .client
                .get(url)
                .send()
                .await?
                .error_for_status()?
                .bytes()
                .await?;
            total_bytes += bytes.len();
        }
        Ok(mbps(total_bytes, start.elapsed()))
    }

    async fn upload(&self, server: &Server) -> Result<f64, ProviderError> {
        let payload = vec![b'0'; UPLOAD_BYTES];
        let start = std::time::Instant::now();
        self.client
            .post(&server.url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(mbps(UPLOAD_BYTES, start.elapsed()))
    }
}

fn mbps(bytes: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64().max(0.001);
    (bytes as f64) * 8.0 / 1_000_000.0 / secs
}

// sibling of the upload script: `.../speedtest/upload.php` + `latency.txt`
fn endpoint(upload_url: &str, name: &str) -> Result<Url, ProviderError> {
    Url::parse(upload_url)
        .and_then(|url| url.join(name))
        .map_err(|err| ProviderError::Malformed(format!("server url '{upload_url}': {err}")))
}

fn parse_client_info(xml: &str) -> Result<ClientInfo, ProviderError> {
    let start = xml
        .find("<client ")
        .ok_or_else(|| ProviderError::Malformed("missing <client> element".to_string()))?;
    let tail = &xml[start..];
    let element = &tail[..tail.find('>').unwrap_or(tail.len())];
    Ok(ClientInfo {
        ip: xml_attr(element, "ip"),
        isp: xml_attr(element, "isp"),
    })
}

fn xml_attr(element: &str, name: &str) -> Option<String> {
    let needle = format!(" {name}=\"");
    let start = element.find(&needle)? + needle.len();
    let len = element[start..].find('"')?;
    let value = element[start..start + len].trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn string_or_number<'de, D>(d: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(d)? {
        serde_json::Value::String(s) => s,
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    })
}

#[cfg(test)]
pub mod testing {
    use super::*;

    // a stage set to `None` hangs until its deadline
    #[derive(Clone)]
    pub struct FakeProvider {
        pub client: Option<ClientInfo>,
        pub servers: Option<Vec<Server>>,
        pub latency: Option<Duration>,
        pub download_mbps: Option<f64>,
        pub upload_mbps: Option<f64>,
        pub fail_download: bool,
    }

    impl Default for FakeProvider {
        fn default() -> Self {
            Self {
                client: Some(ClientInfo {
                    ip: Some("203.0.113.7".to_string()),
                    isp: Some("Example ISP".to_string()),
                }),
                servers: Some(vec![
                    server("2", "Far", 900.0),
                    server("1", "Near", 12.0),
                ]),
                latency: Some(Duration::from_millis(15)),
                download_mbps: Some(93.5),
                upload_mbps: Some(41.2),
                fail_download: false,
            }
        }
    }

    pub fn server(id: &str, name: &str, distance: f64) -> Server {
        Server {
            url: format!("http://{name}.example:8080/speedtest/upload.php").to_lowercase(),
            id: id.to_string(),
            name: name.to_string(),
            country: "Ukraine".to_string(),
            sponsor: "Sponsor".to_string(),
            distance: Some(distance),
        }
    }

    async fn hang<T>() -> T {
        std::future::pending::<T>().await
    }

    #[async_trait]
    impl SpeedProvider for FakeProvider {
        async fn client_info(&self) -> Result<ClientInfo, ProviderError> {
            match &self.client {
                Some(c) => Ok(c.clone()),
                None => hang().await,
            }
        }

        async fn servers(&self) -> Result<Vec<Server>, ProviderError> {
            match &self.servers {
                Some(s) => Ok(s.clone()),
                None => hang().await,
            }
        }

        async fn latency(&self, _server: &Server) -> Result<Duration, ProviderError> {
            match self.latency {
                Some(l) => Ok(l),
                None => hang().await,
            }
        }

        async fn download(&self, _server: &Server) -> Result<f64, ProviderError> {
            if self.fail_download {
                return Err(ProviderError::Malformed("connection reset".to_string()));
            }
            match self.download_mbps {
                Some(v) => Ok(v),
                None => hang().await,
            }
        }

        async fn upload(&self, _server: &Server) -> Result<f64, ProviderError> {
            match self.upload_mbps {
                Some(v) => Ok(v),
                None => hang().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn limits() -> SpeedtestLimits {
        SpeedtestLimits {
            context_timeout: Duration::from_millis(200),
            stage_timeout: Duration::from_millis(200),
            pipeline_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn successful_run_uses_nearest_server() {
        let result = run_speedtest(&FakeProvider::default(), limits())
            .await
            .expect("speedtest");
        assert_eq!(result.download_mbps, 93.5);
        assert_eq!(result.upload_mbps, 41.2);
        assert!((result.latency_ms - 15.0).abs() < 1e-9);
        assert_eq!(result.isp.as_deref(), Some("Example ISP"));
        assert_eq!(
            result.server.as_deref(),
            Some("Near, Ukraine (Sponsor) • ID 1")
        );
    }

    #[tokio::test]
    async fn empty_server_list_is_no_candidate() {
        let provider = FakeProvider {
            servers: Some(vec![]),
            ..FakeProvider::default()
        };
        let err = run_speedtest(&provider, limits()).await.unwrap_err();
        assert!(matches!(err, SpeedtestError::NoCandidate));
        assert_eq!(err.user_message(), "⚠️ Speedtest: no suitable server found");
    }

    #[tokio::test]
    async fn hanging_client_info_times_out_on_its_own_deadline() {
        let provider = FakeProvider {
            client: None,
            ..FakeProvider::default()
        };
        let err = run_speedtest(&provider, limits()).await.unwrap_err();
        assert!(matches!(
            err,
            SpeedtestError::Timeout {
                stage: Stage::ClientInfo,
                fired: TimeoutSource::Stage
            }
        ));
    }

    #[tokio::test]
    async fn pipeline_deadline_wins_when_it_is_earlier() {
        let provider = FakeProvider {
            upload_mbps: None,
            ..FakeProvider::default()
        };
        let tight = SpeedtestLimits {
            context_timeout: Duration::from_millis(100),
            stage_timeout: Duration::from_secs(10),
            pipeline_timeout: Duration::from_millis(150),
        };
        let err = run_speedtest(&provider, tight).await.unwrap_err();
        assert!(matches!(
            err,
            SpeedtestError::Timeout {
                stage: Stage::Upload,
                fired: TimeoutSource::Pipeline
            }
        ));
    }

    #[tokio::test]
    async fn stage_failure_names_the_stage() {
        let provider = FakeProvider {
            fail_download: true,
            ..FakeProvider::default()
        };
        let err = run_speedtest(&provider, limits()).await.unwrap_err();
        assert!(matches!(
            err,
            SpeedtestError::Stage {
                stage: Stage::Download,
                ..
            }
        ));
        assert_eq!(err.user_message(), "⚠️ Speedtest: download test failed");
    }

    #[test]
    fn selection_skips_servers_without_url() {
        let mut broken = server("9", "Broken", 1.0);
        broken.url.clear();
        let picked = select_server(vec![broken, server("3", "Ok", 50.0)]).unwrap();
        assert_eq!(picked.id, "3");
        assert!(select_server(vec![]).is_none());
    }

    #[test]
    fn throughput_units() {
        assert_eq!(format_throughput(0.5), "500 kbit/s");
        assert_eq!(format_throughput(93.456), "93.46 Mbit/s");
        assert_eq!(format_throughput(1250.0), "1.25 Gbit/s");
    }

    #[test]
    fn missing_labels_render_as_na() {
        let result = SpeedResult {
            download_mbps: 10.0,
            upload_mbps: 5.0,
            latency_ms: 20.0,
            isp: None,
            server: None,
        };
        let text = format_speedtest(&result, "🟢 OK");
        assert!(text.contains("🏷 ISP:      n/a"));
        assert!(text.contains("🗺 Server:   n/a"));
        assert!(text.contains("🕒 Ping:     20.0 ms"));
    }

    #[test]
    fn parses_client_element() {
        let xml = r#"<?xml version="1.0"?><settings><client ip="198.51.100.4" lat="50.4" lon="30.5" isp="Kyivstar" isprating="3.7" /></settings>"#;
        let info = parse_client_info(xml).unwrap();
        assert_eq!(info.ip.as_deref(), Some("198.51.100.4"));
        assert_eq!(info.isp.as_deref(), Some("Kyivstar"));
        assert!(parse_client_info("<settings/>").is_err());
    }

    #[test]
    fn server_json_accepts_numeric_and_string_ids() {
        let json = r#"[{"url":"http://a:8080/speedtest/upload.php","id":"42","name":"A","distance":3},
                       {"url":"http://b:8080/speedtest/upload.php","id":7,"name":"B"}]"#;
        let servers: Vec<Server> = serde_json::from_str(json).unwrap();
        assert_eq!(servers[0].id, "42");
        assert_eq!(servers[0].distance, Some(3.0));
        assert_eq!(servers[1].id, "7");
        assert_eq!(servers[1].distance, None);
    }

    #[test]
    fn endpoints_sit_next_to_the_upload_script() {
        assert_eq!(
            endpoint("http://host:8080/speedtest/upload.php", "latency.txt")
                .unwrap()
                .as_str(),
            "http://host:8080/speedtest/latency.txt"
        );
        assert_eq!(
            endpoint("http://a/upload.php", "random350x350.jpg")
                .unwrap()
                .as_str(),
            "http://a/random350x350.jpg"
        );
        assert!(matches!(
            endpoint("upload.php", "latency.txt"),
            Err(ProviderError::Malformed(_))
        ));
    }
}
