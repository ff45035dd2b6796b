pub mod mem;
pub mod postgres;

pub use self::mem::{InMemoryDefinitionRepository, InMemoryOutbox};
pub use self::postgres::{PostgresDefinitionRepository, PostgresOutbox};
