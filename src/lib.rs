/*!
# Dashboard Data Service

Backend of a business-intelligence dashboard, built in Rust.

## Overview

Every user owns one active data source: a Google Sheets document or an
uploaded spreadsheet/CSV file. The service resolves that source, reads a
named sheet into a matrix of cell strings and reshapes the header-tagged rows
into typed records (revenue per quarter, per-person performance, target vs
achievement) that the dashboard charts render.

## Architecture

### Ingestion Layer
- **Data Source Resolver** (`source`) - Latest descriptor per owner, atomic replace
- **Spreadsheet Adapter** (`sheets`) - Google Sheets values API over HTTP
- **File Adapter** (`loader`) - CSV and workbook uploads with sheet fallback

### Normalization Layer
- **Row-to-Record Normalizer** (`normalizer`) - Section/label routing,
  positional quarter columns, defensive number parsing

### Web Layer
- **Routing and handlers** (`app`) - Upload, delete, read, dashboard, events
- **Accounts** (`login`) - Registration, sessions, profile, password change

## Data Flow

request -> session check -> resolver -> (spreadsheet | file) adapter ->
raw sheet -> normalizer -> JSON records

## REST API Endpoints

- `POST /signup`, `/login`, `/logout` - Account and session management
- `POST /api/upload` - Store a spreadsheet upload as the owner's source
- `POST /api/delete-file` - Remove an upload (missing files are not an error)
- `GET|DELETE /api/source`, `POST /api/source/spreadsheet` - Manage the source
- `GET /api/sheets` - Sheet names of an uploaded workbook
- `GET /api/data` - Raw rows of a sheet with row count and source metadata
- `GET /api/dashboard` - Normalized records of a given kind
- `GET /api/events/next` - Long-poll for source changes
*/

pub mod config;
pub mod error;
pub mod loader;
pub mod login;
pub mod normalizer;
pub mod raw;
pub mod sheets;
pub mod source;

#[cfg(feature = "web")]
pub mod app;

pub use config::Config;
pub use error::{AppError, AuthError, IngestError, NormalizeError, StoreError};
pub use normalizer::{DashboardRecord, RecordKind, RevenueData, coerce, normalize};
pub use raw::RawSheet;
pub use source::{DataSourceDescriptor, DescriptorStore, SourceKind, resolve};
