pub mod chunker;
pub mod keyword;
pub mod vector;

pub use keyword::KeywordIndex;
pub use vector::VectorIndex;
