// =============================================================================
// API Module
// =============================================================================
//
// Read-only operator surface: health/freshness plus the full state snapshot.

pub mod rest;
