//! Helper macros for the `overlay` connection fabric.
//!
//! The router selects a child transport ("local", "ssh", "sudo", "docker",
//! ...) by a plain method-name string supplied by the caller of
//! `Router::connect`. `#[derive(Transport)]` turns a plain enum listing the
//! supported transports into the string registry the router needs: a
//! kebab-case method name per variant, a `FromStr` impl for parsing an
//! incoming method name, and a `const` array enumerating every variant so
//! the registry can be built once at startup.

use convert_case::{Case, Casing};
use proc_macro2::TokenStream;
use quote::quote;
use syn::{parse_macro_input, ItemEnum};

#[proc_macro_derive(Transport)]
pub fn derive_transport(item: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let input = parse_macro_input!(item as ItemEnum);

    derive_transport_enum(input).into()
}

fn derive_transport_enum(item: ItemEnum) -> TokenStream {
    let ident = item.ident.clone();
    let mut method_names = vec![];
    let mut as_ref_arms = vec![];
    let mut from_str_arms = vec![];
    let mut all_variants = vec![];

    for variant in item.variants.iter() {
        let variant_ident = &variant.ident;
        let name = variant_ident.to_string().to_case(Case::Kebab);

        method_names.push(quote! { #name });
        as_ref_arms.push(quote! { Self::#variant_ident => #name, });
        from_str_arms.push(quote! { #name => Ok(Self::#variant_ident), });
        all_variants.push(quote! { Self::#variant_ident, });
    }
    let count = all_variants.len();

    quote! {
        impl #ident {
            /// Method names for every declared transport, in declaration order.
            pub const METHOD_NAMES: [&'static str; #count] = [#(#method_names),*];

            /// Every declared transport variant, in declaration order.
            pub const fn all() -> [#ident; #count] {
                [#(#all_variants)*]
            }
        }

        impl AsRef<str> for #ident {
            fn as_ref(&self) -> &str {
                match self {
                    #(#as_ref_arms)*
                }
            }
        }

        impl std::str::FromStr for #ident {
            type Err = &'static str;

            fn from_str(method_name: &str) -> Result<Self, Self::Err> {
                match method_name {
                    #(#from_str_arms)*
                    _ => Err("unknown transport method name"),
                }
            }
        }

        impl std::fmt::Display for #ident {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_ref())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syn::parse_quote;

    #[test]
    fn kebab_cases_method_names() {
        let item: ItemEnum = parse_quote! {
            enum TransportKind {
                Local,
                Ssh,
                Sudo,
                Docker,
            }
        };
        let tokens = derive_transport_enum(item).to_string();
        assert!(tokens.contains("\"local\""));
        assert!(tokens.contains("\"ssh\""));
        assert!(tokens.contains("\"sudo\""));
        assert!(tokens.contains("\"docker\""));
    }
}
