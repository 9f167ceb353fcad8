//! Provides derive macros for `sky::HasDependencies`.
use quote::quote;
use syn::{
    parse::Parse, punctuated::Punctuated, Data, DataStruct, DeriveInput, Field, Fields, Ident,
    Token,
};

/// Returns `true` if the field is marked `#[sky(skip)]`.
fn is_skipped(field: &Field) -> syn::Result<bool> {
    let mut skip = false;
    for att in field.attrs.iter() {
        if att.path().is_ident("sky") {
            att.parse_nested_meta(|meta| {
                if meta.path.is_ident("skip") {
                    skip = true;
                    Ok(())
                } else {
                    Err(meta.error(format!(
                        "unsupported field attribute {:?} - must be 'skip'",
                        meta.path
                            .get_ident()
                            .map(|id| id.to_string())
                            .unwrap_or("unknown".to_string())
                    )))
                }
            })?;
        }
    }
    Ok(skip)
}

fn get_field_dependencies(input: &DeriveInput) -> syn::Result<Vec<proc_macro2::TokenStream>> {
    let fields = match &input.data {
        Data::Struct(DataStruct { fields, .. }) => fields,
        _ => {
            return Err(syn::Error::new(
                input.ident.span(),
                "deriving HasDependencies only supports structs".to_string(),
            ));
        }
    };

    let mut merges = vec![];
    match fields {
        Fields::Named(named) => {
            for field in named.named.iter() {
                if is_skipped(field)? {
                    continue;
                }
                // UNWRAP: safe because these are named fields
                let ident = field.ident.clone().unwrap();
                merges.push(quote! {
                    .merge(sky::HasDependencies::dependencies(&self.#ident))
                });
            }
        }
        Fields::Unnamed(unnamed) => {
            for (i, field) in unnamed.unnamed.iter().enumerate() {
                if is_skipped(field)? {
                    continue;
                }
                let index = syn::Index::from(i);
                merges.push(quote! {
                    .merge(sky::HasDependencies::dependencies(&self.#index))
                });
            }
        }
        Fields::Unit => {}
    }
    Ok(merges)
}

/// Derives `sky::HasDependencies` by merging the dependencies of every field.
///
/// Fields marked `#[sky(skip)]` are not consulted.
#[proc_macro_derive(HasDependencies, attributes(sky))]
pub fn derive_has_dependencies(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let input: DeriveInput = syn::parse_macro_input!(input);
    let name = &input.ident;
    let merges = match get_field_dependencies(&input) {
        Ok(m) => m,
        Err(e) => return e.into_compile_error().into(),
    };
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let output = quote! {
        impl #impl_generics sky::HasDependencies for #name #ty_generics #where_clause {
            fn dependencies(&self) -> sky::Dependencies {
                sky::Dependencies::default()
                    #(#merges)*
            }
        }
    };
    output.into()
}

struct TupleIdents {
    idents: Punctuated<Ident, Token![,]>,
}

impl Parse for TupleIdents {
    fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
        let content;
        syn::parenthesized!(content in input);
        Ok(TupleIdents {
            idents: content.parse_terminated(Ident::parse, Token![,])?,
        })
    }
}

/// Implements `HasDependencies` for a tuple of the given type parameters,
/// eg. `impl_has_dependencies_tuples!((A, B, C))`.
#[proc_macro]
pub fn impl_has_dependencies_tuples(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let TupleIdents { idents } = syn::parse_macro_input!(input as TupleIdents);
    let params: Vec<_> = idents.iter().collect();
    let indices: Vec<_> = (0..params.len()).map(syn::Index::from).collect();
    let output = quote! {
        impl<#(#params: sky::HasDependencies),*> sky::HasDependencies for (#(#params,)*) {
            fn dependencies(&self) -> sky::Dependencies {
                sky::Dependencies::default()
                    #(.merge(self.#indices.dependencies()))*
            }
        }
    };
    output.into()
}
