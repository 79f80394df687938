use proc_macro::TokenStream;

use quote::{format_ident, quote};
use syn::{
    Attribute, Expr, ExprArray, ExprLit, ItemStruct, Lit, Meta, Token, parse::Parser,
    spanned::Spanned,
};

/// Attaches static playbook metadata (id, tier, priority, known symptoms) to a
/// unit struct. The struct still implements `FixPlaybook` by hand and returns
/// `Self::playbook_info()` from `info()`.
#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Playbook(attr: TokenStream, item: TokenStream) -> TokenStream {
    match playbook_impl(attr, item) {
        Ok(ts) => ts,
        Err(e) => e.to_compile_error().into(),
    }
}

fn lit_str(expr: &Expr) -> syn::Result<String> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Str(s), ..
        }) => Ok(s.value()),
        _ => Err(syn::Error::new(expr.span(), "expected string literal")),
    }
}

fn expr_array_strings(expr: &Expr) -> syn::Result<Vec<String>> {
    let Expr::Array(ExprArray { elems, .. }) = expr else {
        return Err(syn::Error::new(expr.span(), "expected array literal"));
    };
    let mut out = Vec::new();
    for e in elems {
        out.push(lit_str(e)?);
    }
    Ok(out)
}

fn drop_our_attrs(attrs: &[Attribute]) -> Vec<Attribute> {
    attrs
        .iter()
        .filter(|a| {
            let Meta::Path(p) = &a.meta else {
                return true;
            };
            let Some(ident) = p.get_ident() else {
                return true;
            };
            ident != "Playbook"
        })
        .cloned()
        .collect()
}

fn tier_variant(raw: &str, span: proc_macro2::Span) -> syn::Result<syn::Ident> {
    let name = match raw.trim().to_ascii_lowercase().as_str() {
        "infrastructure" | "tier1" => "Tier1Infrastructure",
        "core_integrity" | "core-integrity" | "tier2" => "Tier2CoreIntegrity",
        "plugin_theme_conflicts" | "plugin-theme-conflicts" | "tier3" => {
            "Tier3PluginThemeConflicts"
        }
        other => {
            return Err(syn::Error::new(
                span,
                format!(
                    "unknown tier '{other}'; expected infrastructure, core_integrity or plugin_theme_conflicts"
                ),
            ));
        }
    };
    Ok(format_ident!("{}", name))
}

fn priority_variant(raw: &str, span: proc_macro2::Span) -> syn::Result<syn::Ident> {
    let name = match raw.trim().to_ascii_lowercase().as_str() {
        "critical" => "Critical",
        "high" => "High",
        "medium" => "Medium",
        "low" => "Low",
        other => {
            return Err(syn::Error::new(
                span,
                format!("unknown priority '{other}'; expected critical, high, medium or low"),
            ));
        }
    };
    Ok(format_ident!("{}", name))
}

struct PlaybookMeta {
    id: String,
    name: String,
    description: String,
    tier: syn::Ident,
    priority: syn::Ident,
    symptoms: Vec<String>,
}

fn playbook_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = drop_our_attrs(&st.attrs);
    let struct_ident = st.ident.clone();

    let parser = syn::punctuated::Punctuated::<Meta, Token![,]>::parse_terminated;
    let metas = parser.parse(attr)?;

    let mut id: Option<String> = None;
    let mut name: Option<String> = None;
    let mut description: Option<String> = None;
    let mut tier: Option<syn::Ident> = None;
    let mut priority: Option<syn::Ident> = None;
    let mut symptoms: Vec<String> = Vec::new();

    for m in metas {
        let Meta::NameValue(nv) = m else {
            return Err(syn::Error::new(m.span(), "expected key = value"));
        };
        let Some(key) = nv.path.get_ident().map(|i| i.to_string()) else {
            return Err(syn::Error::new(nv.path.span(), "expected ident key"));
        };
        let v = &nv.value;
        match key.as_str() {
            "id" => id = Some(lit_str(v)?),
            "name" => name = Some(lit_str(v)?),
            "description" => description = Some(lit_str(v)?),
            "tier" => tier = Some(tier_variant(&lit_str(v)?, v.span())?),
            "priority" => priority = Some(priority_variant(&lit_str(v)?, v.span())?),
            "symptoms" => symptoms = expr_array_strings(v)?,
            other => {
                return Err(syn::Error::new(
                    nv.path.span(),
                    format!("unknown Playbook attribute key '{other}'"),
                ));
            }
        }
    }

    let missing = |what: &str| syn::Error::new(struct_ident.span(), format!("Playbook: missing {what}"));
    let meta = PlaybookMeta {
        id: id.ok_or_else(|| missing("id"))?,
        name: name.ok_or_else(|| missing("name"))?,
        description: description.unwrap_or_default(),
        tier: tier.ok_or_else(|| missing("tier"))?,
        priority: priority.ok_or_else(|| missing("priority"))?,
        symptoms,
    };

    if meta.id.trim().is_empty() {
        return Err(syn::Error::new(struct_ident.span(), "Playbook: id is empty"));
    }

    let id_lit = meta.id;
    let name_lit = meta.name;
    let description_lit = meta.description;
    let tier = meta.tier;
    let priority = meta.priority;
    let symptom_lits = meta.symptoms;

    let expanded = quote! {
        #st

        impl #struct_ident {
            pub const ID: &'static str = #id_lit;
            pub const NAME: &'static str = #name_lit;
            pub const TIER: crate::playbooks::Tier = crate::playbooks::Tier::#tier;
            pub const PRIORITY: crate::playbooks::Priority = crate::playbooks::Priority::#priority;
            pub const SYMPTOMS: &'static [&'static str] = &[#(#symptom_lits),*];

            pub fn playbook_info() -> crate::playbooks::PlaybookInfo {
                crate::playbooks::PlaybookInfo {
                    id: #id_lit,
                    name: #name_lit,
                    description: #description_lit,
                    tier: crate::playbooks::Tier::#tier,
                    priority: crate::playbooks::Priority::#priority,
                }
            }

            // Case-insensitive match of any known symptom against evidence text.
            pub fn matches_symptoms(text: &str) -> bool {
                let lower = text.to_ascii_lowercase();
                Self::SYMPTOMS
                    .iter()
                    .any(|s| lower.contains(&s.to_ascii_lowercase()))
            }
        }
    };

    Ok(expanded.into())
}
