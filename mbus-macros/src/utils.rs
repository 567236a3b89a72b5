use proc_macro2::Span;
use syn::punctuated::Punctuated;
use syn::{ItemTrait, Lifetime, Token, TypeParamBound};

// snake_case 方法名转换为 UpperCamelCase 变体名
pub(crate) fn to_upper_camel(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for part in name.split('_').filter(|p| !p.is_empty()) {
        let mut chars = part.chars();
        if let Some(first) = chars.next() {
            out.extend(first.to_uppercase());
            out.push_str(chars.as_str());
        }
    }
    if out.is_empty() {
        // 仅由下划线构成的名称
        out.push_str("Call");
    }
    out
}

/// 确保 trait 带有 `Send + Sync + 'static` 父约束（缺失则追加，已有的保持原样）
pub(crate) fn ensure_supertraits(item: &mut ItemTrait) {
    let needs_send = !has_trait_bound(&item.supertraits, "Send");
    let needs_sync = !has_trait_bound(&item.supertraits, "Sync");
    let needs_static = !item
        .supertraits
        .iter()
        .any(|b| matches!(b, TypeParamBound::Lifetime(l) if l.ident == "static"));

    if needs_send {
        item.supertraits
            .push(syn::parse_quote!(::std::marker::Send));
    }
    if needs_sync {
        item.supertraits
            .push(syn::parse_quote!(::std::marker::Sync));
    }
    if needs_static {
        item.supertraits.push(TypeParamBound::Lifetime(Lifetime::new(
            "'static",
            Span::call_site(),
        )));
    }

    if item.colon_token.is_none() {
        item.colon_token = Some(Default::default());
    }
}

fn has_trait_bound(bounds: &Punctuated<TypeParamBound, Token![+]>, name: &str) -> bool {
    bounds.iter().any(|b| match b {
        TypeParamBound::Trait(t) => t
            .path
            .segments
            .last()
            .map(|seg| seg.ident == name)
            .unwrap_or(false),
        _ => false,
    })
}
