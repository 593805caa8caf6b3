//! Procedural macros for sqldb.
//!
//! `#[derive(Record)]` maps a struct with named fields to table columns.
//!
//! # Attributes
//!
//! On the struct:
//!
//! - `#[db(table = "users")]` / `#[db(table = "schema.users")]` sets the table
//!   name. Records without one can still be scanned and embedded, but not
//!   used for DML.
//! - `#[db(untagged = "field" | "snake_case" | "ignore")]` chooses how fields
//!   without a `#[db(...)]` attribute are mapped (default `"field"`: the
//!   field name is the column name).
//! - `#[db(crate = "sqldb::sqldb_core")]` sets the path generated code uses
//!   for `sqldb-core`.
//!
//! On fields:
//!
//! - `#[db("name")]` or `#[db(name = "name")]` sets the column name.
//! - `pk` / `primarykey`, `readonly` and `default` set column flags and can
//!   be combined with a name: `#[db("id", pk, default)]`.
//! - `#[db(skip)]` or `#[db("-")]` leaves the field unmapped.
//! - `#[db(flatten)]` embeds another `Record`; its columns are mapped at
//!   this level.
//!
//! Column and table names are validated at compile time.
//!
//! Generated code refers to `::sqldb_core` unless `crate = "..."` says
//! otherwise. Crates that depend only on the `sqldb` facade use
//! `#[db(crate = "sqldb::sqldb_core")]`.

use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

mod record_derive;

/// Derive the `Record` trait.
#[proc_macro_derive(Record, attributes(db))]
pub fn derive_record(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match record_derive::parse_record(&input) {
        Ok(def) => record_derive::generate_record_impl(&def).into(),
        Err(err) => err.to_compile_error().into(),
    }
}
