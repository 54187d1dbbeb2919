mod db;
mod rows;
mod schema;

pub use db::VectorDB;
