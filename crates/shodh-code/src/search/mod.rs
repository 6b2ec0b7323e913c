pub mod fusion;
pub mod hybrid;
pub mod rewriter;

pub use hybrid::{HybridSearchEngine, SearchRequest};
pub use rewriter::{QueryRewriter, RewrittenQuery};
