use mbus_core::listener::ListenerShape;
use mbus_core::publisher::Publisher;
use mbus_macros::listener;

#[listener(shape = "project.settings", message = SettingsChange, publisher = SettingsBroadcast)]
pub trait SettingsListener: Send + Sync {
    fn changed(&self, key: String, value: Option<String>);
}

fn takes_publisher<P: SettingsBroadcast>(_: &P) {}

fn check(publisher: &Publisher<dyn SettingsListener>) {
    takes_publisher(publisher);
}

fn main() {
    let _ = check;
    assert_eq!(
        <dyn SettingsListener as ListenerShape>::SHAPE,
        "project.settings"
    );
    let _ = SettingsChange::Changed {
        key: "theme".into(),
        value: None,
    };
}
