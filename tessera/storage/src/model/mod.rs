pub mod edge;
pub mod properties;
pub mod schema;
pub mod vertex;

pub use edge::{Edge, EdgeKey, EdgeRef};
pub use properties::PropertyStore;
pub use schema::{PrimaryKeySchema, SchemaProperty, Schemas};
pub use vertex::{PrimaryKey, Vertex, VertexKey};
