//! Multi-pod log streaming.
//!
//! One live log source per running, non-ephemeral pod of the app is fanned
//! into a single ordered output stream. Each source runs on its own task
//! and is pull-based: it reads its next line only after the aggregator has
//! consumed the previous one, so no source can race ahead of the merge.
//!
//! Each round the aggregator waits for the sources that have no buffered
//! token, up to a long timeout on the first round (slow-starting pods are
//! not skipped) and a short one afterwards. It returns early the moment the
//! previously-serviced ("critical") source produces its next token or
//! terminates, which keeps steady-state latency at one token's arrival
//! rather than a full timeout. The smallest buffered token by the
//! comparator is written with a `[<pod>] ` prefix, and its source gets the
//! next read grant.

use std::cmp::Ordering;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::{AsyncBufReadExt, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, LogParams};
use kube::Client;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use datacol_core::config::LogBudget;
use datacol_core::types::{RUN_PROCESS_KIND, TYPE_LABEL};
use datacol_core::{EngineConfig, Result};
use datacol_deploy::pod::list_running_pods;

/// Selection and log-subresource options for a stream request.
#[derive(Debug, Clone, Default)]
pub struct LogStreamOptions {
    /// Restrict to one process type.
    pub proctype: Option<String>,
    /// Keep following the logs after the current tail.
    pub follow: bool,
    /// Only lines newer than this many seconds.
    pub since_seconds: Option<i64>,
    /// Only the last N lines of each pod.
    pub tail_lines: Option<i64>,
}

/// One live line source feeding the multiplexer.
pub struct LogSource {
    /// Prefix label written before every line of this source.
    pub label: String,
    /// The line tokens.
    pub lines: BoxStream<'static, std::io::Result<String>>,
}

/// Multiplexer tuning.
#[derive(Clone)]
pub struct MultiplexOptions {
    /// Wait for the first token of every source this long.
    pub first_timeout: Duration,
    /// Steady-state per-round wait.
    pub next_timeout: Duration,
    /// Token ordering; smallest is emitted first.
    pub compare: fn(&[u8], &[u8]) -> Ordering,
}

impl Default for MultiplexOptions {
    fn default() -> Self {
        Self::from_budget(&LogBudget::default())
    }
}

impl MultiplexOptions {
    pub fn from_budget(budget: &LogBudget) -> Self {
        Self {
            first_timeout: budget.first_timeout(),
            next_timeout: budget.next_timeout(),
            compare: |a, b| a.cmp(b),
        }
    }
}

/// Stream the merged logs of an app's pods into `w`.
pub async fn log_stream<W>(
    client: &Client,
    config: &EngineConfig,
    w: &mut W,
    namespace: &str,
    app: &str,
    opts: LogStreamOptions,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let pods_api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let pods = list_running_pods(client, namespace, app).await?;
    debug!(count = pods.len(), app, "pods matched for log streaming");

    let mut sources = Vec::new();
    for pod in &pods {
        let labels = pod.metadata.labels.clone().unwrap_or_default();
        let proctype = labels.get(TYPE_LABEL).cloned().unwrap_or_default();

        if let Some(filter) = &opts.proctype {
            if *filter != proctype {
                continue;
            }
        }
        // Ephemeral run pods are interactive sessions, not log producers.
        if proctype == RUN_PROCESS_KIND {
            continue;
        }

        let name = pod.metadata.name.clone().unwrap_or_default();
        let container = pod
            .spec
            .as_ref()
            .and_then(|s| s.containers.first())
            .map(|c| c.name.clone());

        let lp = LogParams {
            follow: opts.follow,
            container,
            since_seconds: opts.since_seconds,
            tail_lines: opts.tail_lines,
            ..Default::default()
        };

        match pods_api.log_stream(&name, &lp).await {
            Ok(reader) => {
                let label = name
                    .strip_prefix(&format!("{app}-"))
                    .unwrap_or(&name)
                    .to_string();
                debug!(pod = %name, "log source attached");
                sources.push(LogSource {
                    label,
                    lines: reader.lines().boxed(),
                });
            }
            Err(e) => error!(pod = %name, error = %e, "creating log stream"),
        }
    }

    multiplex(sources, w, MultiplexOptions::from_budget(&config.logs)).await
}

enum SourceEvent {
    Token(usize, String),
    End(usize),
}

/// Source worker tasks die with the multiplexer, including when the
/// consumer drops the future mid-stream.
struct Workers(Vec<tokio::task::JoinHandle<()>>);

impl Drop for Workers {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

struct Slot {
    label: String,
    token: Option<String>,
    done: bool,
    grant_tx: mpsc::Sender<()>,
}

/// Merge the sources into one ordered stream written to `w`.
///
/// Terminates when every source reached end-of-stream and no buffered
/// token remains. The first write error aborts every source.
pub async fn multiplex<W>(sources: Vec<LogSource>, w: &mut W, opts: MultiplexOptions) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if sources.is_empty() {
        return Ok(());
    }

    let (event_tx, mut event_rx) = mpsc::channel::<SourceEvent>(sources.len());
    let mut slots = Vec::with_capacity(sources.len());
    let mut workers = Workers(Vec::with_capacity(sources.len()));

    for (idx, source) in sources.into_iter().enumerate() {
        let LogSource { label, mut lines } = source;
        let (grant_tx, mut grant_rx) = mpsc::channel::<()>(1);
        // The first read needs no emission to unlock it.
        let _ = grant_tx.try_send(());

        let tx = event_tx.clone();
        workers.0.push(tokio::spawn(async move {
            while grant_rx.recv().await.is_some() {
                match lines.next().await {
                    Some(Ok(line)) => {
                        if tx.send(SourceEvent::Token(idx, line)).await.is_err() {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "log source read failed");
                        let _ = tx.send(SourceEvent::End(idx)).await;
                        return;
                    }
                    None => {
                        let _ = tx.send(SourceEvent::End(idx)).await;
                        return;
                    }
                }
            }
        }));

        slots.push(Slot {
            label,
            token: None,
            done: false,
            grant_tx,
        });
    }
    drop(event_tx);

    let mut critical: Option<usize> = None;
    let mut first_round = true;

    loop {
        if slots.iter().all(|s| s.done && s.token.is_none()) {
            return Ok(());
        }

        if slots.iter().any(|s| !s.done && s.token.is_none()) {
            let budget = if first_round {
                opts.first_timeout
            } else {
                opts.next_timeout
            };
            let deadline = Instant::now() + budget;

            loop {
                if !slots.iter().any(|s| !s.done && s.token.is_none()) {
                    break;
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match tokio::time::timeout(remaining, event_rx.recv()).await {
                    Ok(Some(event)) => {
                        let idx = match event {
                            SourceEvent::Token(idx, line) => {
                                slots[idx].token = Some(line);
                                idx
                            }
                            SourceEvent::End(idx) => {
                                slots[idx].done = true;
                                idx
                            }
                        };
                        // The serviced source answered; everyone else
                        // either has a token buffered or is done.
                        if critical == Some(idx) {
                            break;
                        }
                    }
                    Ok(None) => {
                        for slot in &mut slots {
                            slot.done = true;
                        }
                        break;
                    }
                    Err(_) => break,
                }
            }
        }
        first_round = false;

        let smallest = slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.token.as_deref().map(|t| (i, t)))
            .min_by(|(_, a), (_, b)| (opts.compare)(a.as_bytes(), b.as_bytes()))
            .map(|(i, _)| i);

        let Some(i) = smallest else {
            // Nothing arrived this round; sources may still be alive.
            continue;
        };
        let Some(token) = slots[i].token.take() else {
            continue;
        };

        let line = format!("[{}] {token}\n", slots[i].label);
        if let Err(e) = w.write_all(line.as_bytes()).await {
            // Dropping `workers` aborts every source.
            return Err(e.into());
        }

        let _ = slots[i].grant_tx.try_send(());
        critical = Some(i);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    fn fixed_source(label: &str, lines: &[&str]) -> LogSource {
        let items: Vec<io::Result<String>> =
            lines.iter().map(|l| Ok(l.to_string())).collect();
        LogSource {
            label: label.to_string(),
            lines: stream::iter(items).boxed(),
        }
    }

    fn silent_source(label: &str) -> LogSource {
        LogSource {
            label: label.to_string(),
            lines: stream::pending().boxed(),
        }
    }

    fn quick_options() -> MultiplexOptions {
        MultiplexOptions {
            first_timeout: Duration::from_millis(200),
            next_timeout: Duration::from_millis(50),
            compare: |a, b| a.cmp(b),
        }
    }

    #[tokio::test]
    async fn merges_all_lines_exactly_once_in_order() {
        let sources = vec![
            fixed_source("web-1", &["a-1", "a-2", "a-3"]),
            fixed_source("web-2", &["b-1", "b-2", "b-3"]),
        ];

        let started = std::time::Instant::now();
        let mut out = Vec::new();
        multiplex(sources, &mut out, quick_options()).await.unwrap();

        let out = String::from_utf8(out).unwrap();
        assert_eq!(
            out,
            "[web-1] a-1\n[web-1] a-2\n[web-1] a-3\n[web-2] b-1\n[web-2] b-2\n[web-2] b-3\n"
        );
        // First timeout plus a small multiple of the steady-state timeout.
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn comparator_decides_emission_order() {
        let sources = vec![
            fixed_source("web-1", &["a-1"]),
            fixed_source("web-2", &["b-1"]),
        ];

        let mut opts = quick_options();
        opts.compare = |a, b| b.cmp(a);

        let mut out = Vec::new();
        multiplex(sources, &mut out, opts).await.unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.starts_with("[web-2] b-1\n"));
    }

    #[tokio::test]
    async fn slow_first_token_is_waited_for() {
        let late = LogSource {
            label: "late".to_string(),
            lines: stream::once(async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok("a-late".to_string())
            })
            .boxed(),
        };
        let sources = vec![late, fixed_source("fast", &["b-fast"])];

        let mut out = Vec::new();
        multiplex(sources, &mut out, quick_options()).await.unwrap();

        // The late token arrived within the first-timeout window, so it
        // still won its place in the ordering.
        let out = String::from_utf8(out).unwrap();
        assert_eq!(out, "[late] a-late\n[fast] b-fast\n");
    }

    #[tokio::test]
    async fn silent_source_does_not_block_others_past_first_timeout() {
        let sources = vec![
            silent_source("quiet"),
            fixed_source("busy", &["x-1", "x-2", "x-3"]),
        ];

        let started = std::time::Instant::now();
        let mut out = Vec::new();
        // The silent source never terminates, so the stream never ends;
        // every busy line must still be through well before this deadline.
        let _ = tokio::time::timeout(
            Duration::from_millis(800),
            multiplex(sources, &mut out, quick_options()),
        )
        .await;

        let out = String::from_utf8(out).unwrap();
        assert_eq!(out, "[busy] x-1\n[busy] x-2\n[busy] x-3\n");
        assert!(started.elapsed() >= Duration::from_millis(800));
    }

    #[tokio::test]
    async fn empty_source_list_finishes_immediately() {
        let mut out = Vec::new();
        multiplex(Vec::new(), &mut out, quick_options()).await.unwrap();
        assert!(out.is_empty());
    }

    struct FailingWriter;

    impl AsyncWrite for FailingWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn write_error_aborts_the_stream() {
        let sources = vec![
            fixed_source("web-1", &["a-1", "a-2"]),
            silent_source("quiet"),
        ];

        let mut failing = FailingWriter;
        let err = multiplex(sources, &mut failing, quick_options())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("closed"));
    }
}
