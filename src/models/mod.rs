pub mod endpoint;
pub mod gateway;
pub mod purpose;

pub use endpoint::{ByteStream, HttpEndpoint, ModelEndpoint, ModelInfo};
pub use gateway::{ModelGateway, FALLBACK_MODEL_ID};
pub use purpose::Purpose;
