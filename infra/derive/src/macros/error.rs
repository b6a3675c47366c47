use fxhash::FxHashSet;
use proc_macro2::TokenStream;
use quote::{format_ident, quote};
use syn::parse::Parser;
use syn::{Attribute, Data, DeriveInput, Field, Fields, FieldsNamed, Ident, Type, Variant};

enum Cause<'a> {
    /// `source: T`: converted with `From<T>` and reachable through `.context(...)`.
    Required { field: &'a Ident, ty: &'a Type },
    /// `source: Option<T>`: attached by hand, never converted implicitly.
    Optional,
}

struct VariantSpec<'a> {
    ident: &'a Ident,
    cause: Option<Cause<'a>>,
    has_context: bool,
    has_message: bool,
    cfg_attrs: Vec<Attribute>,
}

pub fn expand(args: TokenStream, input: DeriveInput) -> TokenStream {
    match expand_inner(args, &input) {
        Ok(tokens) => tokens,
        Err(err) => err.to_compile_error(),
    }
}

fn expand_inner(args: TokenStream, input: &DeriveInput) -> syn::Result<TokenStream> {
    let fallback = parse_fallback(args)?;

    let Data::Enum(data) = &input.data else {
        return Err(syn::Error::new_spanned(&input.ident, "lumen_error only supports enums"));
    };

    let specs = data.variants.iter().map(inspect_variant).collect::<syn::Result<Vec<_>>>()?;

    for spec in &specs {
        if matches!(spec.cause, Some(Cause::Required { .. })) && !spec.has_context {
            return Err(syn::Error::new_spanned(
                spec.ident,
                "variants with a source need `context: Option<Cow<'static, str>>`",
            ));
        }
    }

    let name = &input.ident;
    let ext = format_ident!("{}Ext", name);

    let derives = missing_derives(input);
    let ext_trait = context_trait(name, &ext, &specs);
    let conversions = specs.iter().filter_map(|spec| source_conversion(name, &ext, spec));
    let fallback_impls = fallback_conversions(name, fallback.as_ref(), &specs)?;
    let predicates = predicates(name, &specs);

    Ok(quote! {
        #[allow(non_shorthand_field_patterns)]
        #derives
        #input

        #ext_trait
        #(#conversions)*
        #fallback_impls
        #predicates

        #[allow(dead_code)]
        fn format_context(context: &Option<std::borrow::Cow<'static, str>>) -> std::borrow::Cow<'static, str> {
            context.as_ref().map_or(std::borrow::Cow::Borrowed(""), |c| std::borrow::Cow::Owned(format!(" ({c})")))
        }
    })
}

fn parse_fallback(args: TokenStream) -> syn::Result<Option<Ident>> {
    let mut fallback = None;
    let parser = syn::meta::parser(|meta| {
        if meta.path.is_ident("fallback") {
            fallback = Some(meta.value()?.parse::<Ident>()?);
            Ok(())
        } else {
            Err(meta.error("unsupported lumen_error argument, expected `fallback = Variant`"))
        }
    });
    parser.parse2(args)?;
    Ok(fallback)
}

fn inspect_variant(variant: &Variant) -> syn::Result<VariantSpec<'_>> {
    let Fields::Named(fields) = &variant.fields else {
        return Err(syn::Error::new_spanned(
            variant,
            "lumen_error variants must use named fields",
        ));
    };

    let has_context = match named(fields, "context") {
        Some(field) if !is_context_type(&field.ty) => {
            return Err(syn::Error::new_spanned(
                &field.ty,
                "context field must be Option<Cow<'static, str>>",
            ));
        },
        Some(_) => true,
        None => false,
    };

    let cause = fields
        .named
        .iter()
        .find(|field| {
            field.ident.as_ref().is_some_and(|ident| ident == "source")
                || has_attr(field, "source")
                || has_attr(field, "from")
        })
        .map(|field| {
            if is_option(&field.ty) {
                Cause::Optional
            } else {
                Cause::Required {
                    field: field.ident.as_ref().unwrap_or(&variant.ident),
                    ty: &field.ty,
                }
            }
        });

    Ok(VariantSpec {
        ident: &variant.ident,
        cause,
        has_context,
        has_message: named(fields, "message").is_some(),
        cfg_attrs: variant.attrs.iter().filter(|a| a.path().is_ident("cfg")).cloned().collect(),
    })
}

fn context_trait(name: &Ident, ext: &Ident, specs: &[VariantSpec<'_>]) -> TokenStream {
    let arms = specs.iter().filter(|spec| spec.has_context).map(|spec| {
        let ident = spec.ident;
        let cfg = &spec.cfg_attrs;
        quote! { #(#cfg)* #name::#ident { context: slot, .. } => *slot = Some(context.into()), }
    });

    quote! {
        pub trait #ext<T> {
            fn context(self, context: impl Into<std::borrow::Cow<'static, str>>) -> Result<T, #name>;
        }

        #[automatically_derived]
        impl<T> #ext<T> for Result<T, #name> {
            #[inline]
            fn context(self, context: impl Into<std::borrow::Cow<'static, str>>) -> Self {
                self.map_err(|mut err| {
                    #[allow(unreachable_patterns)]
                    match &mut err {
                        #(#arms)*
                        _ => {}
                    }
                    err
                })
            }
        }
    }
}

fn source_conversion(name: &Ident, ext: &Ident, spec: &VariantSpec<'_>) -> Option<TokenStream> {
    let Some(Cause::Required { field, ty }) = &spec.cause else {
        return None;
    };
    let ident = spec.ident;
    let cfg = &spec.cfg_attrs;

    Some(quote! {
        #(#cfg)*
        #[automatically_derived]
        impl From<#ty> for #name {
            #[inline]
            fn from(#field: #ty) -> Self { Self::#ident { #field, context: None } }
        }

        #(#cfg)*
        impl<T> #ext<T> for std::result::Result<T, #ty> {
            #[inline]
            fn context(self, context: impl Into<std::borrow::Cow<'static, str>>) -> std::result::Result<T, #name> {
                self.map_err(|#field| #name::#ident { #field, context: Some(context.into()) })
            }
        }
    })
}

fn fallback_conversions(
    name: &Ident,
    fallback: Option<&Ident>,
    specs: &[VariantSpec<'_>],
) -> syn::Result<TokenStream> {
    let Some(fallback) = fallback else {
        return Ok(quote!());
    };
    let Some(spec) = specs.iter().find(|spec| spec.ident == fallback) else {
        return Err(syn::Error::new_spanned(fallback, "fallback variant does not exist"));
    };
    if !spec.has_message || !spec.has_context {
        return Err(syn::Error::new_spanned(
            fallback,
            "fallback variant needs `message` and `context` fields",
        ));
    }

    let cfg = &spec.cfg_attrs;
    let optional_source = matches!(spec.cause, Some(Cause::Optional));
    let extra = if optional_source { quote! { source: None, } } else { quote!() };

    Ok(quote! {
        #(#cfg)*
        impl From<&'static str> for #name {
            #[inline]
            fn from(s: &'static str) -> Self {
                Self::#fallback { message: std::borrow::Cow::Borrowed(s), context: None, #extra }
            }
        }
        #(#cfg)*
        impl From<String> for #name {
            #[inline]
            fn from(s: String) -> Self {
                Self::#fallback { message: std::borrow::Cow::Owned(s), context: None, #extra }
            }
        }
    })
}

fn predicates(name: &Ident, specs: &[VariantSpec<'_>]) -> TokenStream {
    let fns = specs.iter().map(|spec| {
        let ident = spec.ident;
        let cfg = &spec.cfg_attrs;
        let predicate = format_ident!("is_{}", snake_case(&ident.to_string()));
        let doc = format!("Returns `true` for [`{name}::{ident}`].");
        quote! {
            #(#cfg)*
            #[doc = #doc]
            #[must_use]
            pub const fn #predicate(&self) -> bool {
                matches!(self, Self::#ident { .. })
            }
        }
    });

    quote! {
        #[automatically_derived]
        impl #name {
            #(#fns)*
        }
    }
}

fn missing_derives(input: &DeriveInput) -> TokenStream {
    let mut present = FxHashSet::default();
    for attr in input.attrs.iter().filter(|a| a.path().is_ident("derive")) {
        let _ = attr.parse_nested_meta(|meta| {
            if let Some(last) = meta.path.segments.last() {
                present.insert(last.ident.to_string());
            }
            Ok(())
        });
    }

    let mut wanted = Vec::new();
    if !present.contains("Debug") {
        wanted.push(quote! { Debug });
    }
    if !present.contains("Error") {
        wanted.push(quote! { ::thiserror::Error });
    }
    if wanted.is_empty() { quote!() } else { quote! { #[derive(#(#wanted),*)] } }
}

fn named<'a>(fields: &'a FieldsNamed, wanted: &str) -> Option<&'a Field> {
    fields.named.iter().find(|field| field.ident.as_ref().is_some_and(|ident| ident == wanted))
}

fn has_attr(field: &Field, attr: &str) -> bool {
    field.attrs.iter().any(|a| a.path().is_ident(attr))
}

fn is_option(ty: &Type) -> bool {
    let Type::Path(path) = ty else {
        return false;
    };
    path.path.segments.last().is_some_and(|seg| seg.ident == "Option")
}

fn is_context_type(ty: &Type) -> bool {
    let rendered: String = quote!(#ty).to_string().chars().filter(|c| !c.is_whitespace()).collect();
    let inner = rendered
        .strip_prefix("std::option::Option<")
        .or_else(|| rendered.strip_prefix("Option<"))
        .and_then(|rest| rest.strip_suffix('>'));

    inner.is_some_and(|cow| {
        matches!(cow, "Cow<'static,str>" | "std::borrow::Cow<'static,str>" | "borrow::Cow<'static,str>")
    })
}

fn snake_case(ident: &str) -> String {
    let mut out = String::with_capacity(ident.len() + 4);
    for (i, ch) in ident.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snake_case_splits_on_capitals() {
        assert_eq!(snake_case("QuotaExceeded"), "quota_exceeded");
        assert_eq!(snake_case("Io"), "io");
        assert_eq!(snake_case("InitializationFailed"), "initialization_failed");
    }

    #[test]
    fn context_type_accepts_qualified_paths() {
        let plain: Type = syn::parse_quote!(Option<Cow<'static, str>>);
        let qualified: Type = syn::parse_quote!(Option<std::borrow::Cow<'static, str>>);
        let wrong: Type = syn::parse_quote!(Option<String>);
        assert!(is_context_type(&plain));
        assert!(is_context_type(&qualified));
        assert!(!is_context_type(&wrong));
    }

    #[test]
    fn rejects_source_without_context() {
        let input: DeriveInput = syn::parse_quote! {
            pub enum DemoError {
                #[error("io: {source}")]
                Io { source: std::io::Error },
            }
        };
        assert!(expand_inner(TokenStream::new(), &input).is_err());
    }

    #[test]
    fn rejects_tuple_variants() {
        let input: DeriveInput = syn::parse_quote! {
            pub enum DemoError {
                #[error("io: {0}")]
                Io(std::io::Error),
            }
        };
        assert!(expand_inner(TokenStream::new(), &input).is_err());
    }

    #[test]
    fn rejects_unknown_fallback() {
        let input: DeriveInput = syn::parse_quote! {
            pub enum DemoError {
                #[error("failed: {message}")]
                Failed { message: Cow<'static, str>, context: Option<Cow<'static, str>> },
            }
        };
        assert!(expand_inner(quote!(fallback = Internal), &input).is_err());
        assert!(expand_inner(quote!(fallback = Failed), &input).is_ok());
    }

    #[test]
    fn optional_cause_skips_from_impl() {
        let input: DeriveInput = syn::parse_quote! {
            pub enum DemoError {
                #[error("failed: {message}")]
                Failed {
                    message: Cow<'static, str>,
                    context: Option<Cow<'static, str>>,
                    source: Option<Box<dyn std::error::Error + Send + Sync>>,
                },
            }
        };
        let rendered = expand_inner(TokenStream::new(), &input).map(|t| t.to_string());
        let rendered = rendered.unwrap_or_default();
        assert!(rendered.contains("is_failed"));
        assert!(!rendered.contains("impl From <"));
    }
}
