use mbus_macros::listener;

#[derive(Debug, thiserror::Error)]
#[error("index locked")]
pub struct IndexLocked;

#[listener]
pub trait IndexListener {
    fn reindex(&self, roots: Vec<String>) -> Result<(), IndexLocked>;
    fn drop_caches(&self) -> anyhow::Result<()>;
    fn progress(&self, done: u32, total: u32) {
        let _ = (done, total);
    }
}

struct Indexer;

impl IndexListener for Indexer {
    fn reindex(&self, roots: Vec<String>) -> Result<(), IndexLocked> {
        if roots.is_empty() { Err(IndexLocked) } else { Ok(()) }
    }

    fn drop_caches(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

fn main() {
    let listener: std::sync::Arc<dyn IndexListener> = std::sync::Arc::new(Indexer);
    listener.progress(1, 2);
}
