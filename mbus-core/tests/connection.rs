use anyhow::Result as AnyResult;
use mbus_core::error::BusError;
use mbus_core::listener::{ListenerResult, MessageHandler};
use mbus_core::message::RawMessage;
use mbus_core::{BusConfig, CollectingErrorSink, ConnectionHandle, Lifetime, MessageBus, Topic};
use mbus_macros::listener;
use std::sync::{Arc, Mutex};

#[listener]
trait Files {
    fn opened(&self, path: String);
    fn closed(&self, path: String);
}

#[listener]
trait Settings {
    fn changed(&self, key: String);
}

#[derive(Clone, Default)]
struct Log {
    inner: Arc<Mutex<Vec<String>>>,
}

impl Log {
    fn push(&self, line: impl Into<String>) {
        self.inner.lock().unwrap().push(line.into());
    }

    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.inner.lock().unwrap())
    }
}

struct FileLog(Log);

impl Files for FileLog {
    fn opened(&self, path: String) {
        self.0.push(format!("opened {path}"));
    }

    fn closed(&self, path: String) {
        self.0.push(format!("closed {path}"));
    }
}

struct SettingsLog(Log);

impl Settings for SettingsLog {
    fn changed(&self, key: String) {
        self.0.push(format!("changed {key}"));
    }
}

fn collecting_root() -> (MessageBus, Arc<CollectingErrorSink>) {
    let sink = Arc::new(CollectingErrorSink::new());
    let config = BusConfig::builder().error_sink(sink.clone()).build();
    (MessageBus::root("app", config), sink)
}

struct RawLog(Log);

impl MessageHandler for RawLog {
    fn handle(&self, message: &dyn RawMessage) -> ListenerResult {
        let detail = match message.payload().downcast_ref::<FilesMessage>() {
            Some(FilesMessage::Opened { path }) => path.clone(),
            _ => "-".to_string(),
        };
        self.0
            .push(format!("{}.{} {}", message.topic_name(), message.method(), detail));
        Ok(())
    }
}

#[test]
fn default_handler_receives_raw_messages() -> AnyResult<()> {
    let (root, _sink) = collecting_root();
    let files: Topic<dyn Files> = Topic::new("files");
    let settings: Topic<dyn Settings> = Topic::new("settings");
    let log = Log::default();

    let connection = root.connect()?;
    assert!(matches!(
        connection.subscribe_default(&files),
        Err(BusError::NoDefaultHandler { .. })
    ));

    connection.set_default_handler(RawLog(log.clone()))?;
    connection.subscribe_default(&files)?;
    connection.subscribe_default(&settings)?;

    root.publish(&files, FilesMessage::Opened { path: "a.rs".into() })?;
    root.publish(&settings, SettingsMessage::Changed { key: "theme".into() })?;
    assert_eq!(
        log.take(),
        vec!["files.opened a.rs", "settings.changed -"]
    );

    let mut topics = connection.topics();
    topics.sort();
    assert_eq!(topics, vec!["files", "settings"]);
    Ok(())
}

/// 在处理 opened 时发布 settings，并可选择立即投递给 settings 的订阅连接
struct Eager {
    bus: MessageBus,
    settings: Topic<dyn Settings>,
    target: ConnectionHandle,
    immediate: bool,
    log: Log,
}

impl Files for Eager {
    fn opened(&self, path: String) {
        self.log.push(format!("begin {path}"));
        self.bus
            .publish(&self.settings, SettingsMessage::Changed { key: path.clone() })
            .unwrap();
        if self.immediate {
            self.target.deliver_immediately().unwrap();
        }
        self.log.push(format!("end {path}"));
    }

    fn closed(&self, _path: String) {}
}

fn run_eager(immediate: bool) -> AnyResult<Vec<String>> {
    let (root, _sink) = collecting_root();
    let files: Topic<dyn Files> = Topic::new("files");
    let settings: Topic<dyn Settings> = Topic::new("settings");
    let log = Log::default();

    let target = root.connect()?;
    target.subscribe(&settings, Arc::new(SettingsLog(log.clone())) as Arc<dyn Settings>)?;

    let eager = root.connect()?;
    eager.subscribe(
        &files,
        Arc::new(Eager {
            bus: root.clone(),
            settings: settings.clone(),
            target: target.handle(),
            immediate,
            log: log.clone(),
        }) as Arc<dyn Files>,
    )?;

    root.publish(&files, FilesMessage::Opened { path: "x".into() })?;
    eager.dispose()?;
    Ok(log.take())
}

#[test]
fn deliver_immediately_flushes_only_own_jobs() -> AnyResult<()> {
    assert_eq!(run_eager(false)?, vec!["begin x", "end x", "changed x"]);
    assert_eq!(run_eager(true)?, vec!["begin x", "changed x", "end x"]);
    Ok(())
}

#[test]
fn subscribe_named_checks_listener_shape() -> AnyResult<()> {
    let (root, _sink) = collecting_root();
    let child = root.create_child("project")?;
    let files: Topic<dyn Files> = Topic::new("files");
    root.register_topic(&files)?;
    let log = Log::default();

    let connection = child.connect()?;
    let resolved =
        connection.subscribe_named("files", Arc::new(FileLog(log.clone())) as Arc<dyn Files>)?;
    assert_eq!(resolved, files);

    let err = connection
        .subscribe_named("files", Arc::new(SettingsLog(log.clone())) as Arc<dyn Settings>)
        .unwrap_err();
    assert!(matches!(
        err,
        BusError::ShapeMismatch {
            expected: "Files",
            found: "Settings",
            ..
        }
    ));

    let err = connection
        .subscribe_named("missing", Arc::new(FileLog(log.clone())) as Arc<dyn Files>)
        .unwrap_err();
    assert!(matches!(err, BusError::UnknownTopic { .. }));

    root.publisher(&files)?.closed("lib.rs".into())?;
    assert_eq!(log.take(), vec!["closed lib.rs"]);
    Ok(())
}

#[test]
fn lifetime_disposes_bound_connections() -> AnyResult<()> {
    let (root, sink) = collecting_root();
    let files: Topic<dyn Files> = Topic::new("files");
    let log = Log::default();

    let lifetime = Lifetime::new("editor");
    let handle = root.connect_with(&lifetime.child("tab"))?;
    handle.subscribe(&files, Arc::new(FileLog(log.clone())) as Arc<dyn Files>)?;

    root.publish(&files, FilesMessage::Opened { path: "a".into() })?;
    lifetime.dispose();
    assert!(handle.is_disposed());
    root.publish(&files, FilesMessage::Opened { path: "b".into() })?;

    assert_eq!(log.take(), vec!["opened a"]);
    assert!(sink.is_empty());
    Ok(())
}

#[test]
fn long_lived_lifetime_does_not_accumulate_disposed_entries() -> AnyResult<()> {
    let (root, sink) = collecting_root();
    let files: Topic<dyn Files> = Topic::new("files");
    let lifetime = Lifetime::new("application");

    for _ in 0..1_000 {
        let handle = root.connect_with(&lifetime)?;
        handle.subscribe(&files, Arc::new(FileLog(Log::default())) as Arc<dyn Files>)?;
        handle.dispose()?;

        let project = lifetime.child("project");
        root.connect_with(&project)?;
        project.dispose();
    }

    assert_eq!(lifetime.disposer_count(), 0);
    assert_eq!(lifetime.child_count(), 0);
    assert_eq!(root.snapshot().connections, 0);

    let kept = root.connect_with(&lifetime)?;
    assert_eq!(lifetime.disposer_count(), 1);
    lifetime.dispose();
    assert!(kept.is_disposed());
    assert!(sink.is_empty());
    Ok(())
}

#[test]
fn dropping_connection_unsubscribes() -> AnyResult<()> {
    let (root, _sink) = collecting_root();
    let files: Topic<dyn Files> = Topic::new("files");
    let log = Log::default();

    {
        let connection = root.connect()?;
        connection.subscribe(&files, Arc::new(FileLog(log.clone())) as Arc<dyn Files>)?;
        assert_eq!(root.subscriber_count(&files), 1);
    }
    assert_eq!(root.subscriber_count(&files), 0);
    assert_eq!(root.snapshot().connections, 0);
    Ok(())
}

#[test]
fn using_disposed_connection_is_an_integrity_violation() -> AnyResult<()> {
    let (root, sink) = collecting_root();
    let files: Topic<dyn Files> = Topic::new("files");
    let log = Log::default();

    let connection = root.connect()?;
    let handle = connection.handle();
    handle.dispose()?;

    let err = handle
        .subscribe(&files, Arc::new(FileLog(log)) as Arc<dyn Files>)
        .unwrap_err();
    assert!(matches!(err, BusError::ConnectionDisposed { .. }));
    assert!(err.is_integrity_violation());

    let err = handle.dispose().unwrap_err();
    assert!(matches!(err, BusError::AlreadyDisposed { .. }));
    assert_eq!(sink.len(), 2);

    // 守卫析构时发现已释放，不再重复上报
    drop(connection);
    assert_eq!(sink.len(), 2);
    Ok(())
}
