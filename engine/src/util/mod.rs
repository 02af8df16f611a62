//! Small general purpose helpers.

pub mod in_range_option;
