/// Anything with a stable identity can be scheduled.
///
/// Identifiers must be unique within one [`Graph`](crate::Graph).
pub trait Node: Send + Sync + 'static {
    fn id(&self) -> &str;
}

impl Node for String {
    fn id(&self) -> &str {
        self
    }
}

impl Node for &'static str {
    fn id(&self) -> &str {
        self
    }
}
