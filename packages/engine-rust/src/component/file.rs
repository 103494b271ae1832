//! `file:directory` -- writes message bodies to files and polls a
//! directory for new ones.
//!
//! Consumed files are deleted (`delete=true`) or moved into a `.done`
//! subdirectory. A file whose exchange failed stays in place and is picked
//! up again on the next poll.

use std::any::Any;
use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use switchyard_core::pattern::wildcard_match;
use switchyard_core::{Exchange, ExchangePattern, Message, Value};
use tokio::sync::Mutex;

use crate::endpoint::{
    Component, ComponentContext, Consumer, Endpoint, EndpointParams, Producer, RouteBinding,
};
use crate::error::EngineError;
use crate::worker::{BackgroundRunnable, BackgroundWorker};

/// Header naming the file relative to the endpoint directory.
pub const FILE_NAME: &str = "SwitchyardFileName";
/// Header carrying the absolute path of a consumed file.
pub const FILE_PATH: &str = "SwitchyardFilePath";
/// Header carrying the size in bytes of a consumed file.
pub const FILE_LENGTH: &str = "SwitchyardFileLength";
/// Header set by the producer to the path it wrote.
pub const FILE_NAME_PRODUCED: &str = "SwitchyardFileNameProduced";

const DONE_DIR: &str = ".done";
const PARAMETERS: &[&str] = &["fileName", "delay", "delete", "autoCreate", "include"];

pub struct FileComponent;

#[async_trait]
impl Component for FileComponent {
    fn parameter_names(&self) -> &[&'static str] {
        PARAMETERS
    }

    fn create_endpoint(
        &self,
        params: &EndpointParams,
        ctx: &ComponentContext,
    ) -> Result<Arc<dyn Endpoint>, EngineError> {
        let directory = params.path().trim();
        if directory.is_empty() {
            return Err(EngineError::invalid_endpoint(params.uri(), "file endpoint needs a directory"));
        }
        Ok(Arc::new(FileEndpoint {
            uri: params.uri().to_string(),
            settings: Arc::new(FileSettings {
                directory: PathBuf::from(directory),
                file_name: params.get("fileName").map(str::to_string),
                delay: params.millis("delay", 500)?,
                delete: params.flag("delete", false)?,
                auto_create: params.flag("autoCreate", true)?,
                include: params.get("include").map(str::to_string),
                max_attempts: ctx.config.consumer_retry.max_attempts,
            }),
        }))
    }
}

#[derive(Debug)]
struct FileSettings {
    directory: PathBuf,
    file_name: Option<String>,
    delay: Duration,
    delete: bool,
    auto_create: bool,
    include: Option<String>,
    max_attempts: u32,
}

impl FileSettings {
    fn accepts(&self, name: &str) -> bool {
        if name.starts_with('.') {
            return false;
        }
        match &self.include {
            Some(pattern) => wildcard_match(pattern, name),
            None => true,
        }
    }
}

pub struct FileEndpoint {
    uri: String,
    settings: Arc<FileSettings>,
}

impl FileEndpoint {
    #[must_use]
    pub fn directory(&self) -> &Path {
        &self.settings.directory
    }
}

impl Endpoint for FileEndpoint {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn create_producer(&self) -> Result<Arc<dyn Producer>, EngineError> {
        Ok(Arc::new(FileProducer {
            settings: Arc::clone(&self.settings),
        }))
    }

    fn create_consumer(&self, binding: RouteBinding) -> Result<Box<dyn Consumer>, EngineError> {
        Ok(Box::new(FileConsumer {
            settings: Arc::clone(&self.settings),
            binding,
            worker: Mutex::new(None),
        }))
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

struct FileProducer {
    settings: Arc<FileSettings>,
}

impl FileProducer {
    fn target_name(&self, exchange: &Exchange) -> String {
        if let Some(name) = &self.settings.file_name {
            return name.clone();
        }
        match exchange.header(FILE_NAME) {
            Some(Value::Text(name)) if !name.is_empty() => name.clone(),
            _ => exchange.id().to_string(),
        }
    }
}

#[async_trait]
impl Producer for FileProducer {
    async fn process(&self, exchange: &mut Exchange) -> Result<(), EngineError> {
        let path = self.settings.directory.join(self.target_name(exchange));
        let contents = exchange.body_as::<Bytes>()?.unwrap_or_default();

        if let Some(parent) = path.parent() {
            if self.settings.auto_create {
                tokio::fs::create_dir_all(parent).await.map_err(|err| {
                    anyhow::Error::new(err).context(format!("creating {}", parent.display()))
                })?;
            }
        }
        tokio::fs::write(&path, &contents)
            .await
            .map_err(|err| anyhow::Error::new(err).context(format!("writing {}", path.display())))?;

        tracing::debug!(path = %path.display(), bytes = contents.len(), "wrote file");
        exchange.set_header(FILE_NAME_PRODUCED, path.display().to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

struct FilePoller {
    settings: Arc<FileSettings>,
    binding: RouteBinding,
    consecutive_errors: u32,
}

impl FilePoller {
    async fn pending_files(&self) -> std::io::Result<Vec<(String, PathBuf)>> {
        let mut entries = tokio::fs::read_dir(&self.settings.directory).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if self.settings.accepts(&name) {
                files.push((name, entry.path()));
            }
        }
        files.sort();
        Ok(files)
    }

    async fn consume(&self, name: String, path: PathBuf) -> anyhow::Result<bool> {
        let contents = tokio::fs::read(&path).await?;
        let absolute = tokio::fs::canonicalize(&path).await.unwrap_or_else(|_| path.clone());
        let length = i64::try_from(contents.len()).unwrap_or(i64::MAX);
        let message = Message::new(Bytes::from(contents))
            .with_header(FILE_NAME, name.as_str())
            .with_header(FILE_PATH, absolute.display().to_string())
            .with_header(FILE_LENGTH, length);
        let exchange = self.binding.new_exchange(ExchangePattern::InOnly, message);

        let done = match self.binding.deliver(exchange).await {
            Ok(done) => done,
            Err(err) => {
                tracing::warn!(
                    route_id = %self.binding.route_id,
                    file = %name,
                    error = %err,
                    "route refused file"
                );
                return Ok(false);
            }
        };
        if let Some(failure) = done.failure() {
            tracing::warn!(
                route_id = %self.binding.route_id,
                file = %name,
                error = %failure,
                "processing file failed; it will be retried"
            );
            return Ok(true);
        }

        if self.settings.delete {
            tokio::fs::remove_file(&path).await?;
        } else {
            let done_dir = self.settings.directory.join(DONE_DIR);
            tokio::fs::create_dir_all(&done_dir).await?;
            tokio::fs::rename(&path, done_dir.join(&name)).await?;
        }
        Ok(true)
    }

    async fn poll(&mut self) -> anyhow::Result<()> {
        if self.settings.auto_create {
            tokio::fs::create_dir_all(&self.settings.directory).await?;
        }
        for (name, path) in self.pending_files().await? {
            if !self.consume(name, path).await? {
                break;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BackgroundRunnable for FilePoller {
    type Task = Infallible;

    async fn run(&mut self, task: Infallible) {
        match task {}
    }

    async fn on_tick(&mut self) {
        match self.poll().await {
            Ok(()) => {
                if self.consecutive_errors > 0 {
                    self.consecutive_errors = 0;
                    self.binding.health.report_up();
                }
            }
            Err(err) => {
                self.consecutive_errors += 1;
                tracing::warn!(
                    route_id = %self.binding.route_id,
                    directory = %self.settings.directory.display(),
                    attempt = self.consecutive_errors,
                    error = %format!("{err:#}"),
                    "polling directory failed"
                );
                if self.consecutive_errors >= self.settings.max_attempts {
                    self.binding.health.report_down(format!(
                        "cannot poll {}: {err:#}",
                        self.settings.directory.display()
                    ));
                }
            }
        }
    }
}

struct FileConsumer {
    settings: Arc<FileSettings>,
    binding: RouteBinding,
    worker: Mutex<Option<BackgroundWorker<FilePoller>>>,
}

#[async_trait]
impl Consumer for FileConsumer {
    async fn start(&self) -> anyhow::Result<()> {
        let mut worker = self.worker.lock().await;
        if worker.is_none() {
            let poller = FilePoller {
                settings: Arc::clone(&self.settings),
                binding: self.binding.clone(),
                consecutive_errors: 0,
            };
            *worker = Some(BackgroundWorker::start(poller, self.settings.delay));
        }
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let running = self.worker.lock().await.take();
        if let Some(mut worker) = running {
            worker.stop().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SwitchyardContext;
    use crate::route::{RouteBuilder, RouteStatus, StepsDsl};

    fn uri(dir: &Path, params: &str) -> String {
        format!("file:{}{params}", dir.display())
    }

    #[tokio::test]
    async fn producer_writes_named_and_generated_files() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let ctx = SwitchyardContext::new();
        let template = ctx.producer_template();

        template
            .send_body(&uri(&out, "?fileName=fixed.txt"), "one")
            .await
            .unwrap();
        template
            .send_body_and_headers(&uri(&out, ""), "two", [(FILE_NAME, "named.txt")])
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(out.join("fixed.txt")).unwrap(), "one");
        assert_eq!(std::fs::read_to_string(out.join("named.txt")).unwrap(), "two");
    }

    #[tokio::test]
    async fn consumer_moves_files_to_done() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
        std::fs::write(dir.path().join("b.csv"), "beta").unwrap();

        let ctx = SwitchyardContext::new();
        ctx.add_routes([RouteBuilder::from(uri(dir.path(), "?delay=20&include=*.txt"))
            .convert_body_to(switchyard_core::TypeKey::Text)
            .to("mock:files")])
            .await
            .unwrap();
        let mock = ctx.mock("mock:files").unwrap();
        mock.expect_bodies_received(["alpha"]);
        mock.expect_header_received(FILE_NAME, "a.txt");
        ctx.start().await.unwrap();

        mock.assert_is_satisfied(Duration::from_secs(2)).await.unwrap();
        ctx.stop().await;
        assert!(dir.path().join(DONE_DIR).join("a.txt").exists());
        assert!(dir.path().join("b.csv").exists());
    }

    #[tokio::test]
    async fn delete_removes_consumed_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("gone.txt"), "x").unwrap();

        let ctx = SwitchyardContext::new();
        ctx.add_routes([RouteBuilder::from(uri(dir.path(), "?delay=20&delete=true")).to("mock:gone")])
            .await
            .unwrap();
        let mock = ctx.mock("mock:gone").unwrap();
        mock.expect_message_count(1);
        ctx.start().await.unwrap();

        mock.assert_is_satisfied(Duration::from_secs(2)).await.unwrap();
        ctx.stop().await;
        assert!(!dir.path().join("gone.txt").exists());
        assert!(!dir.path().join(DONE_DIR).exists());
    }

    #[tokio::test]
    async fn suspend_stops_polling_until_resume() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = SwitchyardContext::new();
        ctx.add_routes([RouteBuilder::from(uri(dir.path(), "?delay=20"))
            .route_id("files")
            .convert_body_to(switchyard_core::TypeKey::Text)
            .to("mock:files")])
            .await
            .unwrap();
        ctx.start().await.unwrap();

        ctx.suspend_route("files").await.unwrap();
        assert_eq!(ctx.route_status("files").unwrap(), RouteStatus::Suspended);
        std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let mock = ctx.mock("mock:files").unwrap();
        assert_eq!(mock.received_count(), 0);
        assert!(dir.path().join("a.txt").exists());

        mock.expect_bodies_received(["alpha"]);
        ctx.resume_route("files").await.unwrap();
        assert_eq!(ctx.route_status("files").unwrap(), RouteStatus::Started);
        mock.assert_is_satisfied(Duration::from_secs(2)).await.unwrap();
        ctx.stop().await;
        assert!(dir.path().join(DONE_DIR).join("a.txt").exists());
    }

    #[tokio::test]
    async fn unreadable_directory_marks_route_down() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let ctx = SwitchyardContext::new();
        ctx.add_routes([RouteBuilder::from(uri(&missing, "?delay=10&autoCreate=false"))
            .route_id("files")
            .to("mock:never")])
            .await
            .unwrap();
        ctx.start().await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(matches!(
            ctx.route_health("files").unwrap(),
            crate::route::RouteHealth::Down { .. }
        ));
        ctx.stop().await;
    }
}
