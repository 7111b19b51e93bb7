pub mod s3_client;
pub mod s3_error_classifier;
pub mod s3_service;
