use devlens_model::Event;

/// Narrowest publish contract the store, queues, and monitors need.
///
/// The bus implements this; depending on the trait instead of the bus type
/// keeps the bus <-> queue dependency a one-way street.
pub trait SystemEventSink: Send + Sync {
    /// Fire-and-forget emission of an internally generated event. Must not
    /// re-enter the queue path for the event being reported on.
    fn emit(&self, event: Event);
}
