//! `#[timeout_test]` runs a test on its own thread and fails it when it
//! outlives a deadline. Async tests get a fresh Tokio runtime.
//!
//! ```ignore
//! #[timeout_test(secs = 10, multi_thread)]
//! async fn converges() { /* ... */ }
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{Attribute, Ident, ItemFn, LitInt, Token, parse_macro_input};

const DEFAULT_SECS: u64 = 30;

struct Settings {
    secs: u64,
    multi_thread: bool,
}

enum Setting {
    Secs(LitInt),
    MultiThread,
}

impl Parse for Setting {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.peek(LitInt) {
            return Ok(Setting::Secs(input.parse()?));
        }
        let key: Ident = input.parse()?;
        match key.to_string().as_str() {
            "secs" => {
                input.parse::<Token![=]>()?;
                Ok(Setting::Secs(input.parse()?))
            }
            "multi_thread" => Ok(Setting::MultiThread),
            other => Err(syn::Error::new_spanned(
                &key,
                format!("unknown timeout_test option `{other}`"),
            )),
        }
    }
}

impl Parse for Settings {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut settings = Settings {
            secs: DEFAULT_SECS,
            multi_thread: false,
        };
        for setting in Punctuated::<Setting, Token![,]>::parse_terminated(input)? {
            match setting {
                Setting::Secs(lit) => {
                    let secs: u64 = lit.base10_parse()?;
                    if secs == 0 {
                        return Err(syn::Error::new_spanned(lit, "timeout must be positive"));
                    }
                    settings.secs = secs;
                }
                Setting::MultiThread => settings.multi_thread = true,
            }
        }
        Ok(settings)
    }
}

#[proc_macro_attribute]
pub fn timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let settings = parse_macro_input!(attr as Settings);
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    let attrs: Vec<Attribute> = attrs.into_iter().filter(|a| !is_test_marker(a)).collect();
    let secs = settings.secs;
    let name = sig.ident.to_string();

    let body: TokenStream2 = if sig.asyncness.take().is_some() {
        let builder = if settings.multi_thread {
            quote! { tokio::runtime::Builder::new_multi_thread().worker_threads(2) }
        } else {
            quote! { tokio::runtime::Builder::new_current_thread() }
        };
        quote! {
            let runtime = #builder
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime");
            runtime.block_on(async move #block)
        }
    } else {
        quote! { #block }
    };

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let deadline = std::time::Duration::from_secs(#secs);
            let (report, outcome) = std::sync::mpsc::channel();
            std::thread::Builder::new()
                .name(String::from(#name))
                .spawn(move || {
                    let result = std::panic::catch_unwind(
                        std::panic::AssertUnwindSafe(move || { #body }),
                    );
                    let _ = report.send(result);
                })
                .expect("failed to spawn test thread");
            match outcome.recv_timeout(deadline) {
                Ok(Ok(value)) => value,
                Ok(Err(panic)) => std::panic::resume_unwind(panic),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded {} s", #secs)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting")
                }
            }
        }
    })
}

fn is_test_marker(attr: &Attribute) -> bool {
    let path = attr.path();
    path.is_ident("test")
        || (path.segments.len() == 2
            && path.segments[0].ident == "tokio"
            && path.segments[1].ident == "test")
}
