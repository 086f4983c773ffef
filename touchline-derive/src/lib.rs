//! Procedural macros for touchline
//!
//! This crate provides the `OutputShape` derive, which turns a response struct into a static
//! output-shape descriptor consumed by `touchline::shape::extract`.

mod attributes;
mod macros;
mod utils;

use proc_macro::TokenStream;

/// Derive macro for `OutputShape` - generates `Shaped` and `ShapeFieldType` implementations
///
/// Every named field becomes a field of the descriptor, in declaration order. A field whose type
/// (seen through `Option`, `Vec` or `Box`) also derives `OutputShape` becomes a nested field.
///
/// Container attributes:
/// - `#[shape(name = "PlayerOut")]` overrides the descriptor name
/// - `#[shape(rename_all = "camelCase")]` renames every field (`camelCase`, `snake_case`, `PascalCase`)
///
/// Field attributes:
/// - `#[shape(lazy)]` keeps the field out of eager projection
/// - `#[shape(rename = "alias")]` uses `alias` as the field name
/// - `#[shape(scalar)]` treats the field as terminal without consulting its type
///
/// # Example
///
/// ```ignore
/// use touchline::OutputShape;
///
/// #[derive(OutputShape)]
/// pub struct MatchOut {
///     pub opponent: String,
/// }
///
/// #[derive(OutputShape)]
/// pub struct PlayerOut {
///     pub name: String,
///     pub matches: Vec<MatchOut>,
///     #[shape(lazy)]
///     pub notes: Option<String>,
/// }
/// ```
#[proc_macro_derive(OutputShape, attributes(shape))]
pub fn derive_output_shape(input: TokenStream) -> TokenStream {
    macros::derive_output_shape(input)
}
