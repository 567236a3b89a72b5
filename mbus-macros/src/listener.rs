use crate::utils::{ensure_supertraits, to_upper_camel};
use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use std::collections::HashSet;
use syn::ext::IdentExt;
use syn::punctuated::Punctuated;
use syn::spanned::Spanned;
use syn::{
    FnArg, Ident, Item, ItemTrait, LitStr, Pat, Result, Token, TraitItem, Type, parse::Parse,
    parse::ParseStream, parse_macro_input,
};

/// #[listener] 宏实现
pub(crate) fn expand(attr: TokenStream, item: TokenStream) -> TokenStream {
    let cfg = parse_macro_input!(attr as ListenerAttrConfig);
    let input = parse_macro_input!(item as Item);

    let item_trait = match input {
        Item::Trait(t) => t,
        other => {
            return syn::Error::new(other.span(), "#[listener] only on trait")
                .to_compile_error()
                .into();
        }
    };

    match expand_trait(cfg, item_trait) {
        Ok(out) => TokenStream::from(out),
        Err(err) => err.to_compile_error().into(),
    }
}

// 一个监听器方法：方法名、消息变体名、参数
struct ListenerMethod {
    ident: Ident,
    variant: Ident,
    params: Vec<(Ident, Type)>,
}

fn expand_trait(cfg: ListenerAttrConfig, mut item_trait: ItemTrait) -> Result<TokenStream2> {
    if !item_trait.generics.params.is_empty() || item_trait.generics.where_clause.is_some() {
        return Err(syn::Error::new(
            item_trait.generics.span(),
            "#[listener] does not support generic traits",
        ));
    }

    let methods = collect_methods(&item_trait)?;
    if methods.is_empty() {
        return Err(syn::Error::new(
            item_trait.ident.span(),
            "#[listener] trait must declare at least one method",
        ));
    }

    ensure_supertraits(&mut item_trait);

    let vis = &item_trait.vis;
    let trait_ident = &item_trait.ident;
    let shape = cfg
        .shape
        .unwrap_or_else(|| LitStr::new(&trait_ident.unraw().to_string(), trait_ident.span()));
    let message_ident = cfg
        .message
        .unwrap_or_else(|| format_ident!("{}Message", trait_ident.unraw()));
    let publisher_ident = cfg
        .publisher
        .unwrap_or_else(|| format_ident!("{}Publisher", trait_ident.unraw()));

    let mut variants = Vec::with_capacity(methods.len());
    let mut method_arms = Vec::with_capacity(methods.len());
    let mut dispatch_arms = Vec::with_capacity(methods.len());
    let mut publisher_sigs = Vec::with_capacity(methods.len());
    let mut publisher_fns = Vec::with_capacity(methods.len());

    for m in &methods {
        let method = &m.ident;
        let variant = &m.variant;
        let method_name = LitStr::new(&method.unraw().to_string(), method.span());
        let names: Vec<&Ident> = m.params.iter().map(|(name, _)| name).collect();
        let tys: Vec<&Type> = m.params.iter().map(|(_, ty)| ty).collect();

        variants.push(quote! { #variant { #( #names: #tys ),* } });

        method_arms.push(quote! { #message_ident::#variant { .. } => #method_name });

        dispatch_arms.push(quote! {
            #message_ident::#variant { #( #names ),* } => {
                ::mbus_core::listener::IntoListenerResult::into_listener_result(
                    __listener.#method( #( ::std::clone::Clone::clone(#names) ),* )
                )
            }
        });

        let sig = quote! {
            fn #method(&self #( , #names: #tys )*) -> ::mbus_core::error::BusResult<()>
        };
        publisher_fns.push(quote! {
            #sig {
                self.invoke(#message_ident::#variant { #( #names ),* })
            }
        });
        publisher_sigs.push(sig);
    }

    let message_doc = format!("`{}` 的消息枚举：每个变体对应一个方法调用", trait_ident);
    let publisher_doc = format!("`{}` 主题的发布者方法", trait_ident);

    let out = quote! {
        #item_trait

        #[doc = #message_doc]
        #[derive(Debug, Clone)]
        #vis enum #message_ident {
            #( #variants, )*
        }

        impl ::mbus_core::listener::ListenerShape for dyn #trait_ident {
            type Message = #message_ident;

            const SHAPE: &'static str = #shape;

            fn method_of(message: &Self::Message) -> &'static str {
                match message {
                    #( #method_arms, )*
                }
            }

            fn dispatch(
                __listener: &Self,
                __message: &Self::Message,
            ) -> ::mbus_core::listener::ListenerResult {
                match __message {
                    #( #dispatch_arms )*
                }
            }
        }

        #[doc = #publisher_doc]
        #vis trait #publisher_ident {
            #( #publisher_sigs; )*
        }

        impl #publisher_ident for ::mbus_core::publisher::Publisher<dyn #trait_ident> {
            #( #publisher_fns )*
        }
    };

    Ok(out)
}

fn collect_methods(item_trait: &ItemTrait) -> Result<Vec<ListenerMethod>> {
    let mut methods = Vec::new();
    let mut seen = HashSet::new();

    for item in &item_trait.items {
        let f = match item {
            TraitItem::Fn(f) => f,
            other => {
                return Err(syn::Error::new(
                    other.span(),
                    "#[listener] trait may only contain methods",
                ));
            }
        };
        let sig = &f.sig;

        if sig.asyncness.is_some() {
            return Err(syn::Error::new(
                sig.asyncness.span(),
                "listener methods cannot be async",
            ));
        }
        if !sig.generics.params.is_empty() {
            return Err(syn::Error::new(
                sig.generics.span(),
                "listener methods cannot be generic",
            ));
        }

        let mut inputs = sig.inputs.iter();
        match inputs.next() {
            Some(FnArg::Receiver(r))
                if r.reference.is_some() && r.mutability.is_none() && r.colon_token.is_none() => {}
            _ => {
                return Err(syn::Error::new(
                    sig.span(),
                    "listener methods must take `&self`",
                ));
            }
        }

        let mut params = Vec::new();
        for arg in inputs {
            let FnArg::Typed(pt) = arg else {
                return Err(syn::Error::new(arg.span(), "unexpected receiver"));
            };
            let name = match pt.pat.as_ref() {
                Pat::Ident(pi) if pi.by_ref.is_none() && pi.subpat.is_none() => pi.ident.clone(),
                other => {
                    return Err(syn::Error::new(
                        other.span(),
                        "listener parameters must be plain identifiers",
                    ));
                }
            };
            // 参数会进入队列跨调用保存，不能借用
            if matches!(pt.ty.as_ref(), Type::Reference(_) | Type::ImplTrait(_)) {
                return Err(syn::Error::new(
                    pt.ty.span(),
                    "listener parameters must be owned types",
                ));
            }
            params.push((name, (*pt.ty).clone()));
        }

        let variant = format_ident!(
            "{}",
            to_upper_camel(&sig.ident.unraw().to_string()),
            span = sig.ident.span()
        );
        if !seen.insert(variant.to_string()) {
            return Err(syn::Error::new(
                sig.ident.span(),
                format!("method maps to a duplicate message variant `{}`", variant),
            ));
        }

        methods.push(ListenerMethod {
            ident: sig.ident.clone(),
            variant,
            params,
        });
    }

    Ok(methods)
}

// -------- parsing --------

// 解析 listener 宏键值参数：shape = "..."、message = Ident、publisher = Ident
#[derive(Default)]
struct ListenerAttrConfig {
    shape: Option<LitStr>,
    message: Option<Ident>,
    publisher: Option<Ident>,
}

impl Parse for ListenerAttrConfig {
    fn parse(input: ParseStream) -> Result<Self> {
        let mut cfg = Self::default();

        if input.is_empty() {
            return Ok(cfg);
        }

        let elems: Punctuated<ListenerAttrElem, Token![,]> =
            Punctuated::<ListenerAttrElem, Token![,]>::parse_terminated(input)?;

        for elem in elems.into_iter() {
            match elem {
                ListenerAttrElem::Shape(lit) => {
                    if cfg.shape.is_some() {
                        return Err(syn::Error::new(
                            lit.span(),
                            "duplicate key 'shape' in attribute",
                        ));
                    }
                    cfg.shape = Some(lit);
                }
                ListenerAttrElem::Message(ident) => {
                    if cfg.message.is_some() {
                        return Err(syn::Error::new(
                            ident.span(),
                            "duplicate key 'message' in attribute",
                        ));
                    }
                    cfg.message = Some(ident);
                }
                ListenerAttrElem::Publisher(ident) => {
                    if cfg.publisher.is_some() {
                        return Err(syn::Error::new(
                            ident.span(),
                            "duplicate key 'publisher' in attribute",
                        ));
                    }
                    cfg.publisher = Some(ident);
                }
            }
        }

        Ok(cfg)
    }
}

enum ListenerAttrElem {
    Shape(LitStr),
    Message(Ident),
    Publisher(Ident),
}

impl Parse for ListenerAttrElem {
    fn parse(input: ParseStream) -> Result<Self> {
        let key: Ident = input.parse()?;
        let _eq: Token![=] = input.parse()?;
        if key == "shape" {
            Ok(ListenerAttrElem::Shape(input.parse()?))
        } else if key == "message" {
            Ok(ListenerAttrElem::Message(input.parse()?))
        } else if key == "publisher" {
            Ok(ListenerAttrElem::Publisher(input.parse()?))
        } else {
            Err(syn::Error::new(
                key.span(),
                "unknown key in attribute; expected 'shape', 'message' or 'publisher'",
            ))
        }
    }
}
