//! Attribute parsing for `#[shape(...)]`

use syn::{Attribute, Field, LitStr};

/// Container-level options
#[derive(Debug, Default)]
pub struct ShapeOptions {
    pub name: Option<String>,
    pub rename_all: Option<String>,
}

/// Field-level options
#[derive(Debug, Default)]
pub struct FieldOptions {
    pub lazy: bool,
    pub scalar: bool,
    pub rename: Option<String>,
}

pub fn parse_shape_options(attrs: &[Attribute]) -> syn::Result<ShapeOptions> {
    let mut options = ShapeOptions::default();
    for attr in attrs {
        if !attr.path().is_ident("shape") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("name") {
                let value: LitStr = meta.value()?.parse()?;
                options.name = Some(value.value());
                Ok(())
            } else if meta.path.is_ident("rename_all") {
                let value: LitStr = meta.value()?.parse()?;
                options.rename_all = Some(value.value());
                Ok(())
            } else {
                Err(meta.error("unsupported shape container attribute, expected `name` or `rename_all`"))
            }
        })?;
    }
    Ok(options)
}

pub fn parse_field_options(field: &Field) -> syn::Result<FieldOptions> {
    let mut options = FieldOptions::default();
    for attr in &field.attrs {
        if !attr.path().is_ident("shape") {
            continue;
        }
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("lazy") {
                options.lazy = true;
                Ok(())
            } else if meta.path.is_ident("scalar") {
                options.scalar = true;
                Ok(())
            } else if meta.path.is_ident("rename") {
                let value: LitStr = meta.value()?.parse()?;
                options.rename = Some(value.value());
                Ok(())
            } else {
                Err(meta.error("unsupported shape field attribute, expected `lazy`, `scalar` or `rename`"))
            }
        })?;
    }
    Ok(options)
}
