//! Derive macro for `OutputShape` - generates `Shaped` and `ShapeFieldType` implementations
//!
//! The generated descriptor is built once, on first use, and cached in a `OnceLock`. Nesting is
//! resolved at runtime through `ShapeFieldType`, so a field typed `Vec<MatchOut>` picks up
//! `MatchOut`'s descriptor without the macro having to understand container types.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Data, DeriveInput, Fields};

use crate::attributes::{parse_field_options, parse_shape_options};
use crate::utils;

pub fn derive_output_shape(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand(&input) {
        Ok(tokens) => tokens.into(),
        Err(err) => err.to_compile_error().into(),
    }
}

fn expand(input: &DeriveInput) -> syn::Result<TokenStream2> {
    let struct_name = &input.ident;

    if !input.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            &input.generics,
            "OutputShape cannot be derived for generic structs",
        ));
    }

    let fields = match &input.data {
        Data::Struct(syn::DataStruct {
            fields: Fields::Named(fields),
            ..
        }) => &fields.named,
        _ => {
            return Err(syn::Error::new_spanned(
                &input.ident,
                "OutputShape can only be derived for structs with named fields",
            ));
        }
    };

    let options = parse_shape_options(&input.attrs)?;
    let shape_name = options.name.unwrap_or_else(|| struct_name.to_string());

    let mut field_calls: Vec<TokenStream2> = Vec::new();
    for field in fields.iter() {
        let Some(ident) = field.ident.as_ref() else {
            continue;
        };
        let field_options = parse_field_options(field)?;
        let raw_name = ident.to_string();
        let raw_name = raw_name.strip_prefix("r#").unwrap_or(&raw_name).to_string();

        let field_name = match (&field_options.rename, &options.rename_all) {
            (Some(rename), _) => rename.clone(),
            (None, Some(rule)) => utils::apply_rename_rule(rule, &raw_name).ok_or_else(|| {
                syn::Error::new_spanned(&input.ident, format!("unsupported rename_all rule `{rule}`"))
            })?,
            (None, None) => raw_name,
        };
        let field_name = field_name.as_str();
        let field_type = &field.ty;

        let call = if field_options.lazy {
            quote! { .lazy(#field_name) }
        } else if field_options.scalar {
            quote! { .scalar(#field_name) }
        } else {
            quote! {
                .field(
                    #field_name,
                    <#field_type as ::touchline::shape::ShapeFieldType>::nested_shape(),
                )
            }
        };
        field_calls.push(call);
    }

    Ok(quote! {
        impl ::touchline::shape::Shaped for #struct_name {
            fn output_shape() -> &'static ::touchline::shape::OutputShape {
                static SHAPE: ::std::sync::OnceLock<::touchline::shape::OutputShape> =
                    ::std::sync::OnceLock::new();
                SHAPE.get_or_init(|| {
                    ::touchline::shape::OutputShape::builder(#shape_name)
                        #(#field_calls)*
                        .build()
                })
            }
        }

        impl ::touchline::shape::ShapeFieldType for #struct_name {
            fn nested_shape() -> ::std::option::Option<::touchline::shape::ShapeRef> {
                ::std::option::Option::Some(
                    <#struct_name as ::touchline::shape::Shaped>::output_shape,
                )
            }
        }
    })
}
