use mio::event::Event;

/// Receives readiness notifications for one registered token.
///
/// Handlers run on the event loop thread, one event at a time, so an
/// implementation never races itself for the same descriptor.
pub trait EventHandler {
    fn handle_event(&self, event: &Event);
}

impl<F> EventHandler for F
where
    F: Fn(&Event),
{
    fn handle_event(&self, event: &Event) {
        self(event)
    }
}
