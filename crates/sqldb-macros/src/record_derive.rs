//! Implementation of the Record derive macro.
//!
//! This module turns `#[db(...)]` attributes into a `Record` implementation:
//! static field metadata plus the column, value and scan-target collectors.

use proc_macro2::{Span, TokenStream};
use quote::quote;
use regex::Regex;
use std::collections::HashSet;
use syn::ext::IdentExt;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{Data, DeriveInput, Error, Field, Fields, Ident, LitStr, Result, Token, Type};

/// Longest identifier accepted by the PostgreSQL dialect (NAMEDATALEN - 4).
const IDENT_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]{0,58}$";
const TABLE_PATTERN: &str = r"^(?:[A-Za-z_][A-Za-z0-9_]{0,58}\.)?[A-Za-z_][A-Za-z0-9_]{0,58}$";

/// Naming policy for fields without a `#[db(...)]` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UntaggedPolicy {
    /// Use the Rust field name as the column name
    FieldName,
    /// Convert the field name to snake_case
    SnakeCase,
    /// Leave untagged fields unmapped
    Ignore,
}

/// Parsed record definition from a struct with `#[derive(Record)]`.
#[derive(Debug)]
pub struct RecordDef {
    pub name: Ident,
    pub generics: syn::Generics,
    pub table: Option<String>,
    /// Path to the `sqldb-core` crate in generated code
    pub krate: syn::Path,
    pub fields: Vec<RecordFieldDef>,
}

/// How a single field is mapped.
#[derive(Debug)]
pub enum FieldKind {
    Column {
        column: String,
        primary_key: bool,
        read_only: bool,
        has_default: bool,
    },
    Embedded,
    Unmapped,
}

/// Parsed mapping for a single field.
#[derive(Debug)]
pub struct RecordFieldDef {
    pub ident: Ident,
    pub ty: Type,
    pub index: usize,
    pub kind: FieldKind,
}

/// One item inside `#[db(...)]`.
enum DbArg {
    /// A bare string literal: the column name (or `"-"` to skip)
    Name(LitStr),
    /// A bare flag such as `pk` or `flatten`
    Flag(Ident),
    /// `key = "value"`
    KeyValue(Ident, LitStr),
}

impl Parse for DbArg {
    fn parse(input: ParseStream) -> Result<Self> {
        if input.peek(LitStr) {
            return Ok(DbArg::Name(input.parse()?));
        }
        // `crate` is a keyword
        let key = input.call(Ident::parse_any)?;
        if input.peek(Token![=]) {
            input.parse::<Token![=]>()?;
            let value: LitStr = input.parse()?;
            Ok(DbArg::KeyValue(key, value))
        } else {
            Ok(DbArg::Flag(key))
        }
    }
}

fn db_args(attrs: &[syn::Attribute]) -> Result<Vec<(DbArg, Span)>> {
    let mut args = Vec::new();
    for attr in attrs {
        if !attr.path().is_ident("db") {
            continue;
        }
        let parsed = attr.parse_args_with(Punctuated::<DbArg, Token![,]>::parse_terminated)?;
        for arg in parsed {
            let span = match &arg {
                DbArg::Name(lit) => lit.span(),
                DbArg::Flag(ident) | DbArg::KeyValue(ident, _) => ident.span(),
            };
            args.push((arg, span));
        }
    }
    Ok(args)
}

/// Parse a `DeriveInput` into a `RecordDef`.
pub fn parse_record(input: &DeriveInput) -> Result<RecordDef> {
    let data = match &input.data {
        Data::Struct(data) => data,
        Data::Enum(_) => {
            return Err(Error::new_spanned(
                input,
                "Record can only be derived for structs, not enums",
            ));
        }
        Data::Union(_) => {
            return Err(Error::new_spanned(
                input,
                "Record can only be derived for structs, not unions",
            ));
        }
    };

    let mut table = None;
    let mut krate: syn::Path = syn::parse_quote!(::sqldb_core);
    let mut policy = UntaggedPolicy::FieldName;
    for (arg, span) in db_args(&input.attrs)? {
        match arg {
            DbArg::KeyValue(key, value) if key == "table" => {
                let name = value.value();
                if !Regex::new(TABLE_PATTERN)
                    .map_err(|e| Error::new(span, e.to_string()))?
                    .is_match(&name)
                {
                    return Err(Error::new(span, format!("invalid table name {name:?}")));
                }
                table = Some(name);
            }
            DbArg::KeyValue(key, value) if key == "crate" => {
                krate = value.parse()?;
            }
            DbArg::KeyValue(key, value) if key == "untagged" => {
                policy = match value.value().as_str() {
                    "field" => UntaggedPolicy::FieldName,
                    "snake_case" => UntaggedPolicy::SnakeCase,
                    "ignore" => UntaggedPolicy::Ignore,
                    other => {
                        return Err(Error::new(
                            span,
                            format!(
                                "unknown untagged policy {other:?}, expected \"field\", \"snake_case\" or \"ignore\""
                            ),
                        ));
                    }
                };
            }
            _ => {
                return Err(Error::new(
                    span,
                    "expected `table = \"...\"`, `untagged = \"...\"` or `crate = \"...\"` on the struct",
                ));
            }
        }
    }

    let named = match &data.fields {
        Fields::Named(named) => &named.named,
        Fields::Unnamed(_) => {
            return Err(Error::new_spanned(
                &data.fields,
                "Record requires a struct with named fields",
            ));
        }
        Fields::Unit => {
            return Err(Error::new_spanned(
                input,
                "Record requires a struct with named fields",
            ));
        }
    };

    let ident_re = Regex::new(IDENT_PATTERN).map_err(|e| Error::new(Span::call_site(), e.to_string()))?;
    let mut fields = Vec::with_capacity(named.len());
    let mut seen = HashSet::new();
    for (index, field) in named.iter().enumerate() {
        let def = parse_record_field(field, index, policy, &ident_re)?;
        if let FieldKind::Column { column, .. } = &def.kind {
            if !seen.insert(column.clone()) {
                return Err(Error::new_spanned(
                    field,
                    format!("duplicate column name {column:?}"),
                ));
            }
        }
        fields.push(def);
    }

    Ok(RecordDef {
        name: input.ident.clone(),
        generics: input.generics.clone(),
        table,
        krate,
        fields,
    })
}

fn parse_record_field(
    field: &Field,
    index: usize,
    policy: UntaggedPolicy,
    ident_re: &Regex,
) -> Result<RecordFieldDef> {
    let ident = field
        .ident
        .clone()
        .ok_or_else(|| Error::new_spanned(field, "expected named field"))?;
    let field_name = ident.to_string();
    let field_name = field_name.strip_prefix("r#").unwrap_or(&field_name);

    let args = db_args(&field.attrs)?;
    let tagged = !args.is_empty();

    let mut column = None;
    let mut primary_key = false;
    let mut read_only = false;
    let mut has_default = false;
    let mut skip = false;
    let mut flatten = false;

    for (arg, span) in args {
        match arg {
            DbArg::Name(lit) if lit.value() == "-" => skip = true,
            DbArg::Name(lit) => column = Some((lit.value(), span)),
            DbArg::KeyValue(key, value) if key == "name" => column = Some((value.value(), span)),
            DbArg::Flag(flag) if flag == "pk" || flag == "primarykey" => primary_key = true,
            DbArg::Flag(flag) if flag == "readonly" => read_only = true,
            DbArg::Flag(flag) if flag == "default" => has_default = true,
            DbArg::Flag(flag) if flag == "skip" => skip = true,
            DbArg::Flag(flag) if flag == "flatten" => flatten = true,
            DbArg::Flag(flag) => {
                return Err(Error::new(span, format!("unknown db flag `{flag}`")));
            }
            DbArg::KeyValue(key, _) => {
                return Err(Error::new(span, format!("unknown db option `{key}`")));
            }
        }
    }

    let kind = if skip {
        FieldKind::Unmapped
    } else if flatten {
        if column.is_some() || primary_key || read_only || has_default {
            return Err(Error::new_spanned(
                field,
                "`flatten` cannot be combined with a column name or flags",
            ));
        }
        FieldKind::Embedded
    } else if !tagged && policy == UntaggedPolicy::Ignore {
        FieldKind::Unmapped
    } else {
        let (column, span) = match column {
            Some(named) => named,
            None => {
                let derived = if policy == UntaggedPolicy::SnakeCase {
                    to_snake_case(field_name)
                } else {
                    field_name.to_string()
                };
                (derived, ident.span())
            }
        };
        if !ident_re.is_match(&column) {
            return Err(Error::new(span, format!("invalid column name {column:?}")));
        }
        FieldKind::Column {
            column,
            primary_key,
            read_only,
            has_default,
        }
    };

    Ok(RecordFieldDef {
        ident,
        ty: field.ty.clone(),
        index,
        kind,
    })
}

fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let chars: Vec<char> = name.chars().collect();
    for (i, &c) in chars.iter().enumerate() {
        if c.is_uppercase() {
            let prev_lower = i > 0 && (chars[i - 1].is_lowercase() || chars[i - 1].is_ascii_digit());
            let next_lower = chars.get(i + 1).is_some_and(|n| n.is_lowercase());
            let prev_upper = i > 0 && chars[i - 1].is_uppercase();
            if i > 0 && (prev_lower || (prev_upper && next_lower)) && !out.ends_with('_') {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Generate the `Record` implementation.
pub fn generate_record_impl(def: &RecordDef) -> TokenStream {
    let name = &def.name;
    let krate = &def.krate;
    let (impl_generics, ty_generics, where_clause) = def.generics.split_for_impl();

    let table = match &def.table {
        Some(table) => quote! { ::core::option::Option::Some(#table) },
        None => quote! { ::core::option::Option::None },
    };

    let field_count = def.fields.len();
    let mut field_infos = Vec::with_capacity(field_count);
    let mut column_pushes = Vec::new();
    let mut value_pushes = Vec::new();
    let mut target_pushes = Vec::new();
    let mut bound_fields = Vec::new();

    for field in &def.fields {
        let ident = &field.ident;
        let ty = &field.ty;
        let index = field.index;
        let field_name = ident.to_string();
        let field_name = field_name.strip_prefix("r#").unwrap_or(&field_name).to_string();

        match &field.kind {
            FieldKind::Column {
                column,
                primary_key,
                read_only,
                has_default,
            } => {
                let info = quote! {
                    #krate::ColumnInfo::new(#column, #field_name)
                        .primary_key(#primary_key)
                        .read_only(#read_only)
                        .has_default(#has_default)
                };
                field_infos.push(quote! {
                    #krate::FieldInfo::new(
                        #field_name,
                        #index,
                        #krate::FieldMapping::Column(#info),
                    )
                });
                column_pushes.push(quote! {
                    out.push(#krate::MappedColumn::new(#info, prefix, #index));
                });
                value_pushes.push(quote! {
                    out.push(#krate::ToValue::to_value(&self.#ident));
                });
                target_pushes.push(quote! {
                    out.push(#krate::ScanTarget::new(#column, #ident));
                });
                bound_fields.push(ident.clone());
            }
            FieldKind::Embedded => {
                field_infos.push(quote! {
                    #krate::FieldInfo::new(
                        #field_name,
                        #index,
                        #krate::FieldMapping::Embedded,
                    )
                });
                column_pushes.push(quote! {
                    {
                        let mut nested = prefix.to_vec();
                        nested.push(#index);
                        <#ty as #krate::Record>::collect_columns(&nested, out);
                    }
                });
                value_pushes.push(quote! {
                    #krate::Record::collect_values(&self.#ident, out);
                });
                target_pushes.push(quote! {
                    #krate::Record::collect_targets(#ident, out);
                });
                bound_fields.push(ident.clone());
            }
            FieldKind::Unmapped => {
                field_infos.push(quote! {
                    #krate::FieldInfo::new(
                        #field_name,
                        #index,
                        #krate::FieldMapping::Unmapped,
                    )
                });
            }
        }
    }

    quote! {
        #[automatically_derived]
        #[allow(unused_variables, clippy::all, clippy::pedantic)]
        impl #impl_generics #krate::Record for #name #ty_generics #where_clause {
            const TABLE: ::core::option::Option<&'static str> = #table;

            fn record_fields() -> &'static [#krate::FieldInfo] {
                static FIELDS: [#krate::FieldInfo; #field_count] = [#(#field_infos),*];
                &FIELDS
            }

            fn collect_columns(
                prefix: &[usize],
                out: &mut ::std::vec::Vec<#krate::MappedColumn>,
            ) {
                #(#column_pushes)*
            }

            fn collect_values(&self, out: &mut ::std::vec::Vec<#krate::Value>) {
                #(#value_pushes)*
            }

            fn collect_targets<'__sqldb>(
                &'__sqldb mut self,
                out: &mut ::std::vec::Vec<#krate::ScanTarget<'__sqldb>>,
            ) {
                let Self { #(#bound_fields,)* .. } = self;
                #(#target_pushes)*
            }
        }
    }
}
