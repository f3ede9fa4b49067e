pub mod analysis;
pub mod clock;
pub mod ndjson_writer;
pub mod observation;
pub mod store;
pub mod util;
