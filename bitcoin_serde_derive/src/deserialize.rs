use proc_macro::TokenStream;
use quote::quote;
use syn;

pub fn impl_deser_macro(ast: &syn::DeriveInput) -> TokenStream {
    let name = ast.ident.clone();
    let (statements, is_tuple_struct): (Vec<quote::__private::TokenStream>, bool) = match ast.data {
        syn::Data::Struct(ref data) => (
            data.fields
                .iter()
                .zip(0..1_000_000)
                .map(|(field, index)| deserialize_field(field, index))
                .collect(),
            matches!(data.fields, syn::Fields::Unnamed(_)),
        ),
        _ => unimplemented!("BtcDeserialize can only be derived for structs"),
    };
    let expanded = if is_tuple_struct {
        quote! {
            impl BitcoinDeserialize for #name {
                fn bitcoin_deserialize<R: std::io::Read>(mut target: R) -> Result<Self, SerializationError>
                {
                    Ok(#name (
                        #(#statements)*
                    ))
                }
            }
        }
    } else {
        quote! {
            impl BitcoinDeserialize for #name {
                fn bitcoin_deserialize<R: std::io::Read>(mut target: R) -> Result<Self, SerializationError>
                {
                    Ok(#name {
                        #(#statements)*
                    })
                }
            }
        }
    };

    TokenStream::from(expanded)
}

fn deserialize_field(field: &syn::Field, _index: usize) -> quote::__private::TokenStream {
    let ty = field.ty.clone();
    match field.ident.clone() {
        Some(name) => {
            quote! { #name: <#ty as BitcoinDeserialize>::bitcoin_deserialize(&mut target)?, }
        }
        None => {
            quote! { <#ty>::bitcoin_deserialize(&mut target)?, }
        }
    }
}
