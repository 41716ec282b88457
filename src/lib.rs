//! snapclass: upload labeled images, train a classifier on them, predict
//! labels for new images and find matching training images.

pub mod api;
pub mod classifier;
pub mod config;
pub mod dataset;
pub mod db;
pub mod logging;
pub mod matching;
pub mod prediction;
pub mod training;
pub mod upload;
