//! # Derive Layer
//! `Layer` can be derived for a struct composed of other layers and parameters.
//!
//! Fields are visited in declaration order:
//! - `#[remixer(layer)]`: the field implements `Layer`.
//! - `#[remixer(parameter)]`: the field is a `ParameterD`.
//! - `#[remixer(optional_parameter)]`: the field is an `Option<ParameterD>`.
//!
//! Other fields (hyperparameters, shapes) are skipped. Type parameters are bounded by `Layer`.
//!```ignore
//! use remixer::neural_network::{autograd::ParameterD, layer::{Dense, Layer}};
//!
//! #[derive(Layer)]
//! struct Embedding {
//!     #[remixer(layer)]
//!     dense: Dense,
//!     #[remixer(parameter)]
//!     positional: ParameterD,
//!     num_patch: usize,
//! }
//!```
//! Generates:
//!```ignore
//! impl Layer for Embedding {
//!     fn parameters_len(&self) -> usize {
//!         0 + Layer::parameters_len(&self.dense) + 1
//!     }
//!     fn collect_parameters(&self, parameters: &mut Vec<ParameterD>) {
//!         Layer::collect_parameters(&self.dense, parameters);
//!         parameters.push(self.positional.clone());
//!     }
//!     fn collect_parameters_mut<'a>(&'a mut self, parameters: &mut Vec<&'a mut ParameterD>) {
//!         Layer::collect_parameters_mut(&mut self.dense, parameters);
//!         parameters.push(&mut self.positional);
//!     }
//! }
//!```
//! Use `#[remixer(crate)]` on the struct inside the remixer crate itself.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{
    parse_macro_input, parse_quote, Attribute, Data, DeriveInput, Error, GenericParam, Index,
    Member, Meta, NestedMeta, Path, Result,
};

#[derive(Clone, Copy)]
enum FieldKind {
    Layer,
    Parameter,
    OptionalParameter,
}

fn remixer_args(attrs: &[Attribute]) -> Result<Vec<Path>> {
    let mut paths = Vec::new();
    for attr in attrs.iter().filter(|attr| attr.path.is_ident("remixer")) {
        match attr.parse_meta()? {
            Meta::List(list) => {
                for nested in list.nested {
                    match nested {
                        NestedMeta::Meta(Meta::Path(path)) => paths.push(path),
                        nested => {
                            return Err(Error::new_spanned(nested, "expected an identifier"));
                        }
                    }
                }
            }
            meta => return Err(Error::new_spanned(meta, "expected #[remixer(..)]")),
        }
    }
    Ok(paths)
}

fn crate_path(attrs: &[Attribute]) -> Result<TokenStream2> {
    if let Some(path) = remixer_args(attrs)?.into_iter().next() {
        if path.is_ident("crate") {
            return Ok(quote!(crate));
        }
        return Err(Error::new_spanned(path, "expected `crate`"));
    }
    Ok(quote!(::remixer))
}

fn field_kind(attrs: &[Attribute]) -> Result<Option<FieldKind>> {
    let mut kind = None;
    for path in remixer_args(attrs)? {
        let next = if path.is_ident("layer") {
            FieldKind::Layer
        } else if path.is_ident("parameter") {
            FieldKind::Parameter
        } else if path.is_ident("optional_parameter") {
            FieldKind::OptionalParameter
        } else {
            return Err(Error::new_spanned(
                path,
                "expected `layer`, `parameter` or `optional_parameter`",
            ));
        };
        if kind.replace(next).is_some() {
            return Err(Error::new_spanned(path, "field kind specified more than once"));
        }
    }
    Ok(kind)
}

#[proc_macro_derive(Layer, attributes(remixer))]
pub fn derive_layer(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    derive_layer_impl(input)
        .unwrap_or_else(|e| e.to_compile_error())
        .into()
}

fn derive_layer_impl(input: DeriveInput) -> Result<TokenStream2> {
    let krate = crate_path(&input.attrs)?;
    let layer = quote!(#krate::neural_network::layer::Layer);
    let parameter = quote!(#krate::neural_network::autograd::ParameterD);
    let fields = match &input.data {
        Data::Struct(data) => &data.fields,
        _ => {
            return Err(Error::new_spanned(
                &input.ident,
                "Layer can only be derived for structs",
            ))
        }
    };
    let mut len = Vec::new();
    let mut collect = Vec::new();
    let mut collect_mut = Vec::new();
    for (i, field) in fields.iter().enumerate() {
        let member = match &field.ident {
            Some(ident) => Member::Named(ident.clone()),
            None => Member::Unnamed(Index::from(i)),
        };
        match field_kind(&field.attrs)? {
            Some(FieldKind::Layer) => {
                len.push(quote!(#layer::parameters_len(&self.#member)));
                collect.push(quote!(#layer::collect_parameters(&self.#member, parameters);));
                collect_mut
                    .push(quote!(#layer::collect_parameters_mut(&mut self.#member, parameters);));
            }
            Some(FieldKind::Parameter) => {
                len.push(quote!(1));
                collect.push(quote!(parameters.push(self.#member.clone());));
                collect_mut.push(quote!(parameters.push(&mut self.#member);));
            }
            Some(FieldKind::OptionalParameter) => {
                len.push(quote!(usize::from(self.#member.is_some())));
                collect.push(quote! {
                    if let Some(parameter) = self.#member.as_ref() {
                        parameters.push(parameter.clone());
                    }
                });
                collect_mut.push(quote! {
                    if let Some(parameter) = self.#member.as_mut() {
                        parameters.push(parameter);
                    }
                });
            }
            None => (),
        }
    }
    let mut generics = input.generics.clone();
    for param in generics.params.iter_mut() {
        if let GenericParam::Type(param) = param {
            param.bounds.push(parse_quote!(#layer));
        }
    }
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();
    let ident = &input.ident;
    Ok(quote! {
        impl #impl_generics #layer for #ident #ty_generics #where_clause {
            fn parameters_len(&self) -> usize {
                0 #(+ #len)*
            }
            #[allow(unused_variables)]
            fn collect_parameters(&self, parameters: &mut ::std::vec::Vec<#parameter>) {
                #(#collect)*
            }
            #[allow(unused_variables)]
            fn collect_parameters_mut<'a>(
                &'a mut self,
                parameters: &mut ::std::vec::Vec<&'a mut #parameter>,
            ) {
                #(#collect_mut)*
            }
        }
    })
}
