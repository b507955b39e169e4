use proc_macro::TokenStream;
use quote::quote;
use syn::{ItemFn, parse_macro_input};

/// `#[shardcanary::test]`: a test whose log output is captured per test and
/// wrapped in a `test` span carrying the function name.
///
/// Async bodies run under `#[tokio::test]`; attribute arguments are passed
/// through, so `#[shardcanary::test(start_paused = true)]` gives paused time.
/// Other attributes on the function (`#[ignore]`, `#[should_panic]`) are kept.
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let runtime_args = proc_macro2::TokenStream::from(attr);
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);
    let name = sig.ident.to_string();

    let runtime_args = if runtime_args.is_empty() {
        quote! {}
    } else {
        quote! { ( #runtime_args ) }
    };

    let output = match sig.asyncness {
        Some(_) => quote! {
            #[tokio::test #runtime_args]
            #(#attrs)*
            #vis #sig {
                shardcanary::trace::with_test_tracing(#name, || async move #block).await
            }
        },
        None => quote! {
            #[test]
            #(#attrs)*
            #vis #sig {
                shardcanary::trace::with_test_tracing_sync(#name, || #block)
            }
        },
    };
    output.into()
}
