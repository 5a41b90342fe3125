use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{
    parse::Parser,
    punctuated::Punctuated,
    Expr,
    ExprLit,
    FnArg,
    ItemFn,
    Lit,
    MetaNameValue,
    Token,
};

fn expect_async_with_runtime_arg(ast: &ItemFn, macro_name: &str, runtime: &str) {
    let name = &ast.sig.ident;
    if ast.sig.asyncness.is_none() {
        panic!("#[{macro_name}] only works on async functions");
    }
    let Some(FnArg::Typed(_)) = ast.sig.inputs.first() else {
        panic!("#[{macro_name}] requires `{name}` to have `rt: {runtime}` as the first arg");
    };
}

/// Wrap a test body so it runs on a thread with the runtime's stack size.
fn on_test_thread(ast: &ItemFn, body: TokenStream2) -> TokenStream2 {
    let name = &ast.sig.ident;
    let output = &ast.sig.output;
    let attrs = ast.attrs.iter();
    quote! {
        #[test]
        #( #attrs )*
        fn #name() #output {
            #ast
            let builder = std::thread::Builder::new().stack_size(
                *::common::knobs::RUNTIME_STACK_SIZE);
            let handler = builder
                .spawn(move || {
                    #body
                })
                .unwrap();
            handler.join().unwrap()
        }
    }
}

/// Macro to use for tests that need a multi-threaded `ProdRuntime`.
/// Example:
/// ```
/// #[maintenance_macro::prod_rt_test]
/// async fn test_manager(rt: ProdRuntime) -> anyhow::Result<()> {
///     let manager = IndexManager::start(rt, env, catalog, config, shutdown);
///     Ok(())
/// }
/// ```
#[proc_macro_attribute]
pub fn prod_rt_test(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let ast: ItemFn = syn::parse(item).unwrap();
    expect_async_with_runtime_arg(&ast, "prod_rt_test", "ProdRuntime");
    let name = &ast.sig.ident;
    let body = quote! {
        ::cmd_util::env::config_test();
        let tokio = ::runtime::prod::ProdRuntime::init_tokio().unwrap();
        let rt = ::runtime::prod::ProdRuntime::new(&tokio);
        let rt2 = rt.clone();
        let test_future = #name(rt);
        rt2.block_on("test", test_future)
    };
    on_test_thread(&ast, body).into()
}

/// Macro to use for tests that need a deterministic `TestRuntime`: a
/// current-thread runtime whose clock only moves when every task is idle.
/// An optional `seed = N` picks the runtime's rng seed.
/// Example:
/// ```
/// #[maintenance_macro::test_runtime]
/// async fn test_populate(rt: TestRuntime) -> anyhow::Result<()> {
///     rt.wait(Duration::from_secs(60)).await;
///     Ok(())
/// }
/// ```
#[proc_macro_attribute]
pub fn test_runtime(attr: TokenStream, item: TokenStream) -> TokenStream {
    let ast: ItemFn = syn::parse(item).unwrap();
    expect_async_with_runtime_arg(&ast, "test_runtime", "TestRuntime");
    let seed = parse_seed(attr);
    let name = &ast.sig.ident;
    let body = quote! {
        ::cmd_util::env::config_test();
        let __test_driver = ::runtime::testing::TestDriver::new_with_seed(#seed);
        let rt = __test_driver.rt();
        let test_future = #name(rt);
        __test_driver.run_until(test_future)
    };
    on_test_thread(&ast, body).into()
}

fn parse_seed(attr: TokenStream) -> u64 {
    let args = Punctuated::<MetaNameValue, Token![,]>::parse_terminated
        .parse(attr)
        .unwrap();
    let mut seed = 0;
    for arg in args {
        if !arg.path.is_ident("seed") {
            panic!("#[test_runtime] only accepts `seed = N`");
        }
        let Expr::Lit(ExprLit {
            lit: Lit::Int(value),
            ..
        }) = arg.value
        else {
            panic!("#[test_runtime] seed must be an integer literal");
        };
        seed = value.base10_parse().unwrap();
    }
    seed
}
