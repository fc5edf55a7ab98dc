pub mod gc_service;
pub mod migration_service;
pub mod multipart_service;
pub mod object_service;
