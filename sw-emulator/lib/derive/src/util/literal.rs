/*++

Licensed under the Apache-2.0 license.

File Name:

    literal.rs

Abstract:

    General-purpose functions for manipulating literal tokens.

--*/
use std::str::FromStr;

use proc_macro2::{Literal, TokenTree};

use crate::util::token_iter::DisplayToken;

pub fn parse_usize(literal: &TokenTree) -> usize {
    if let TokenTree::Literal(literal) = literal {
        let s = literal.to_string();
        if let Some(s) = s.strip_prefix("0x") {
            if let Ok(val) = usize::from_str_radix(&s.replace('_', ""), 16) {
                return val;
            }
        }
        if let Ok(val) = usize::from_str(&s.replace('_', "")) {
            return val;
        }
    }
    panic!(
        "Can't parse {} as hex",
        &DisplayToken(&Some(literal.clone()))
    );
}

pub fn parse_hex_u32(literal: TokenTree) -> u32 {
    if let TokenTree::Literal(literal) = &literal {
        let s = literal.to_string();
        if let Some(s) = s.strip_prefix("0x") {
            if let Ok(val) = u32::from_str_radix(&s.replace('_', ""), 16) {
                return val;
            }
        }
    }
    panic!("Can't parse {} as hex", &DisplayToken(&Some(literal)));
}

pub fn hex_literal_u32(val: u32) -> TokenTree {
    TokenTree::Literal(
        Literal::from_str(&format!("0x{:04x}_{:04x}", val >> 16, val & 0xffff)).unwrap(),
    )
}
