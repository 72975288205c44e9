//! HTTP routing for the `/api` and `/uploads` surfaces.

pub mod routes;
