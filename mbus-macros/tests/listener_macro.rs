use mbus_core::error::BusError;
use mbus_core::listener::ListenerShape;
use mbus_core::{BusConfig, MessageBus, Topic};
use mbus_macros::listener;
use std::sync::{Arc, Mutex};

#[derive(Debug, thiserror::Error)]
#[error("rejected: {0}")]
struct Rejected(String);

#[listener]
trait Journal {
    fn record(&self, line: String, level: u8);
    fn r#type(&self, kind: String);
    fn validate(&self, line: String) -> Result<(), Rejected>;
}

#[derive(Default)]
struct Lines(Mutex<Vec<String>>);

impl Journal for Lines {
    fn record(&self, line: String, level: u8) {
        self.0.lock().unwrap().push(format!("{level}:{line}"));
    }

    fn r#type(&self, kind: String) {
        self.0.lock().unwrap().push(format!("type={kind}"));
    }

    fn validate(&self, line: String) -> Result<(), Rejected> {
        if line.is_empty() {
            Err(Rejected("empty line".into()))
        } else {
            Ok(())
        }
    }
}

#[test]
fn generated_message_carries_method_and_arguments() {
    let message = JournalMessage::Record {
        line: "boot".into(),
        level: 2,
    };
    assert_eq!(<dyn Journal as ListenerShape>::method_of(&message), "record");
    assert_eq!(
        <dyn Journal as ListenerShape>::method_of(&JournalMessage::Type {
            kind: "x".into()
        }),
        "type"
    );
    assert_eq!(<dyn Journal as ListenerShape>::SHAPE, "Journal");
}

#[test]
fn dispatch_invokes_the_matching_method() {
    let lines = Lines::default();
    let listener: &dyn Journal = &lines;

    <dyn Journal as ListenerShape>::dispatch(
        listener,
        &JournalMessage::Record {
            line: "hello".into(),
            level: 1,
        },
    )
    .unwrap();
    <dyn Journal as ListenerShape>::dispatch(
        listener,
        &JournalMessage::Type {
            kind: "audit".into(),
        },
    )
    .unwrap();

    let err = <dyn Journal as ListenerShape>::dispatch(
        listener,
        &JournalMessage::Validate { line: String::new() },
    )
    .unwrap_err();
    assert_eq!(err.to_string(), "rejected: empty line");

    assert_eq!(*lines.0.lock().unwrap(), vec!["1:hello", "type=audit"]);
}

#[test]
fn generated_publisher_methods_publish_through_the_bus() {
    let bus = MessageBus::root("app", BusConfig::default());
    let topic: Topic<dyn Journal> = Topic::new("journal");
    let lines = Arc::new(Lines::default());

    let connection = bus.connect().unwrap();
    connection
        .subscribe(&topic, lines.clone() as Arc<dyn Journal>)
        .unwrap();

    let publisher = bus.publisher(&topic).unwrap();
    publisher.record("started".into(), 3).unwrap();
    publisher.r#type("boot".into()).unwrap();

    let err = publisher.validate(String::new()).unwrap_err();
    let failures = match err {
        BusError::ListenerFailures(failures) => failures,
        other => panic!("unexpected error: {other}"),
    };
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].method, "validate");
    assert_eq!(failures[0].topic, "journal");

    assert_eq!(*lines.0.lock().unwrap(), vec!["3:started", "type=boot"]);
}
