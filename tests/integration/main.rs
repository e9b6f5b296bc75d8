//! Integration tests for the scheduler
//!
//! These run whole scheduler sessions against the in-process driver and a
//! scripted scraper, with every wait shortened.

mod resume_tests;
mod scheduler_tests;
mod support;
