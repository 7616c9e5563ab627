//! Message counters & the HTTP endpoint exposing them in the Prometheus text exposition format.
//!
//! Only what the listener bot needs is here: a single labeled counter ([LabeledCounter]) and an http
//! server ([MetricsServer]) routing `GET /metrics` to its rendering -- any other path is answered with `404`.

use std::{
    fmt::Write,
    net::SocketAddr,
    sync::Arc,
};
use axum::{
    extract::State,
    http::header,
    response::IntoResponse,
    routing::get,
    Router,
};
use dashmap::DashMap;
use log::{debug, error, trace};
use tokio::{
    net::TcpListener,
    sync::oneshot,
    task::JoinHandle,
};


/// The `Content-Type` of the Prometheus text exposition format
pub const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4";


/// A counter with two labels -- like `shh_messages_total{chat="status", source="0x..."}`
pub struct LabeledCounter {
    name:   String,
    help:   &'static str,
    labels: [&'static str; 2],
    values: DashMap<(String, String), u64>,
}

impl LabeledCounter {

    pub fn new(namespace: &str, name: &str, help: &'static str, labels: [&'static str; 2]) -> Self {
        Self {
            name:   format!("{namespace}_{name}"),
            help,
            labels,
            values: DashMap::new(),
        }
    }

    /// The counter of the messages received by the listener bot
    pub fn messages_total() -> Self {
        Self::new("shh", "messages_total", "Received messages counter.", ["chat", "source"])
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inc(&self, first_label: &str, second_label: &str) {
        *self.values.entry((first_label.to_string(), second_label.to_string())).or_insert(0) += 1;
    }

    pub fn get(&self, first_label: &str, second_label: &str) -> u64 {
        self.values.get(&(first_label.to_string(), second_label.to_string()))
            .map_or(0, |value| *value)
    }

    /// The sum over all label values
    pub fn total(&self) -> u64 {
        self.values.iter()
            .map(|entry| *entry.value())
            .sum()
    }

    /// Renders this counter in the Prometheus text exposition format, series sorted by their labels
    pub fn render(&self) -> String {
        let mut series: Vec<((String, String), u64)> = self.values.iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        series.sort();
        let mut text = format!("# HELP {} {}\n# TYPE {} counter\n", self.name, self.help, self.name);
        for ((first, second), value) in series {
            // writing to a `String` never fails
            let _ = writeln!(text, "{}{{{}=\"{}\",{}=\"{}\"}} {value}",
                             self.name, self.labels[0], escape_label_value(&first), self.labels[1], escape_label_value(&second));
        }
        text
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\")
         .replace('"', "\\\"")
         .replace('\n', "\\n")
}


/// Serves `GET /metrics` with the rendering of a [LabeledCounter], until [Self::shutdown()]
pub struct MetricsServer {
    local_addr:         SocketAddr,
    shutdown_signaler:  oneshot::Sender<()>,
    network_event_loop: JoinHandle<()>,
}

impl MetricsServer {

    /// Binds to `addr` (`host:port` -- port `0` for an ephemeral one) & spawns the http server
    pub async fn start(addr: &str, counter: Arc<LabeledCounter>) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_signaler, shutdown_receiver) = oneshot::channel::<()>();
        let app = Self::routes(counter);
        let network_event_loop = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                // a dropped signaler also means "shutdown"
                let _ = shutdown_receiver.await;
                debug!("`mailserver-bots::MetricsServer`: SHUTDOWN requested -- releasing {local_addr}");
            });
            if let Err(err) = server.await {
                error!("`mailserver-bots::MetricsServer`: ERROR while serving @ {local_addr}: {err}");
            }
        });
        Ok(Self { local_addr, shutdown_signaler, network_event_loop })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections, waiting for the in-flight requests & the server task to end
    pub async fn shutdown(self) {
        // the server may already be gone
        let _ = self.shutdown_signaler.send(());
        if let Err(err) = self.network_event_loop.await {
            error!("`mailserver-bots::MetricsServer`: the http server task ended abnormally: {err}");
        }
    }

    /// `/metrics` is the only route: anything else is answered with `404`
    fn routes(counter: Arc<LabeledCounter>) -> Router {
        Router::new()
            .route("/metrics", get(render_metrics))
            .with_state(counter)
    }
}

async fn render_metrics(State(counter): State<Arc<LabeledCounter>>) -> impl IntoResponse {
    trace!("`mailserver-bots::MetricsServer`: scrape of {}", counter.name());
    ([(header::CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)], counter.render())
}


/// Unit tests for our [metrics](self) module
#[cfg(any(test,doc))]
mod tests {
    use super::*;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    };


    /// Sends a single `method path` request, returning the whole response
    async fn http_request(addr: SocketAddr, method: &str, path: &str) -> String {
        let mut connection = TcpStream::connect(addr).await.expect("connecting to the metrics server");
        connection.write_all(format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n").as_bytes()).await.expect("sending the request");
        let mut response = String::new();
        connection.read_to_string(&mut response).await.expect("reading the response");
        response
    }


    #[cfg_attr(not(doc),test)]
    fn renders_the_exposition_format() {
        let counter = LabeledCounter::messages_total();
        counter.inc("status", "0xab");
        counter.inc("status", "0xab");
        counter.inc("dapps", "say \"hi\"");
        assert_eq!(counter.get("status", "0xab"), 2);
        assert_eq!(counter.total(), 3);
        assert_eq!(counter.render(),
                   "# HELP shh_messages_total Received messages counter.\n\
                    # TYPE shh_messages_total counter\n\
                    shh_messages_total{chat=\"dapps\",source=\"say \\\"hi\\\"\"} 1\n\
                    shh_messages_total{chat=\"status\",source=\"0xab\"} 2\n");
    }

    /// the counter is served on `/metrics` -- & nothing else is
    #[cfg_attr(not(doc),tokio::test)]
    async fn serves_metrics() {
        let counter = Arc::new(LabeledCounter::messages_total());
        counter.inc("status", "");
        let server = MetricsServer::start("127.0.0.1:0", Arc::clone(&counter)).await.expect("starting the metrics server");
        let response = http_request(server.local_addr(), "GET", "/metrics").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
        assert!(response.to_ascii_lowercase().contains("content-type: text/plain; version=0.0.4"), "{response}");
        assert!(response.contains("shh_messages_total{chat=\"status\",source=\"\"} 1"), "{response}");
        let response = http_request(server.local_addr(), "GET", "/").await;
        assert!(response.starts_with("HTTP/1.1 404"), "{response}");
        server.shutdown().await;
    }

    /// scrapers may add query parameters or merely probe the endpoint with `HEAD`
    #[cfg_attr(not(doc),tokio::test)]
    async fn accepts_any_scrape_request() {
        let counter = Arc::new(LabeledCounter::messages_total());
        counter.inc("dapps", "0x01");
        let server = MetricsServer::start("127.0.0.1:0", Arc::clone(&counter)).await.expect("starting the metrics server");
        let response = http_request(server.local_addr(), "GET", "/metrics?format=text").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
        assert!(response.contains("shh_messages_total{chat=\"dapps\",source=\"0x01\"} 1"), "{response}");
        let response = http_request(server.local_addr(), "HEAD", "/metrics").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
        assert!(!response.contains("shh_messages_total{"), "HEAD responses carry no body: {response}");
        server.shutdown().await;
    }
}
