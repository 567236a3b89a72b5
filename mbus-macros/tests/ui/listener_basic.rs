use mbus_core::listener::ListenerShape;
use mbus_macros::listener;

#[listener]
pub trait FileEvents {
    fn opened(&self, path: String);
    fn closed(&self, path: String, dirty: bool);
    fn flushed(&self);
}

fn assert_shape<L: ?Sized + ListenerShape>() {}

fn main() {
    assert_shape::<dyn FileEvents>();
    assert_eq!(<dyn FileEvents as ListenerShape>::SHAPE, "FileEvents");

    let message = FileEventsMessage::Closed {
        path: "a.txt".into(),
        dirty: true,
    };
    assert_eq!(<dyn FileEvents as ListenerShape>::method_of(&message), "closed");
    assert_eq!(
        <dyn FileEvents as ListenerShape>::method_of(&FileEventsMessage::Flushed {}),
        "flushed"
    );
}
