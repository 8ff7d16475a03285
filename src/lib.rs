//! readingroom - resumable acquisition, OCR and correction of declassified
//! archive documents.
//!
//! Every stage persists its progress through the checkpoint store, so any run
//! can be interrupted and resumed without repeating finished work.

pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod llm;
pub mod models;
pub mod ocr;
pub mod rate_limit;
pub mod scrapers;
pub mod services;
pub mod storage;
pub mod work_queue;
