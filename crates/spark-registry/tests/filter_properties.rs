//! 过滤表达式的性质测试。
//!
//! - **Why**：过滤器文本来自配置文件，解析器必须对任意输入给出错误而不是 panic，
//!   规范化输出也必须能被再次解析为同一棵表达式树；
//! - **How**：用 proptest 生成任意字符串与结构化表达式，分别检查“不 panic”与“规范化可重入”。

use proptest::prelude::*;
use spark_registry::{Filter, Properties};

fn key() -> impl Strategy<Value = String> {
    "[a-z][a-z.]{0,6}"
}

fn value() -> impl Strategy<Value = String> {
    "[ -~]{0,8}"
}

fn leaf() -> impl Strategy<Value = Filter> {
    prop_oneof![
        (key(), value()).prop_map(|(key, value)| Filter::Equal { key, value }),
        key().prop_map(|key| Filter::Present { key }),
        (key(), value()).prop_map(|(key, value)| Filter::GreaterEq { key, value }),
        (key(), value()).prop_map(|(key, value)| Filter::LessEq { key, value }),
        (key(), value()).prop_map(|(key, value)| Filter::Approx { key, value }),
        (key(), "[a-z]{1,3}", "[a-z]{1,3}").prop_map(|(key, initial, last)| {
            Filter::Substring {
                key,
                initial: Some(initial),
                any: Vec::new(),
                last: Some(last),
            }
        }),
    ]
}

fn tree() -> impl Strategy<Value = Filter> {
    leaf().prop_recursive(3, 16, 3, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 1..3).prop_map(Filter::And),
            prop::collection::vec(inner.clone(), 1..3).prop_map(Filter::Or),
            inner.prop_map(|filter| Filter::Not(Box::new(filter))),
        ]
    })
}

proptest! {
    #[test]
    fn arbitrary_text_never_panics(input in ".{0,64}") {
        let _ = Filter::parse(&input);
    }

    #[test]
    fn canonical_form_parses_back_to_same_tree(filter in tree()) {
        let rendered = filter.to_string();
        prop_assert_eq!(Filter::parse(&rendered), Ok(filter));
    }

    #[test]
    fn negation_inverts_evaluation(filter in tree(), weight in -5_i64..5, lang in "[a-z]{0,3}") {
        let properties = Properties::new().with("weight", weight).with("lang", lang);
        let negated = Filter::Not(Box::new(filter.clone()));
        prop_assert_eq!(negated.matches(&properties), !filter.matches(&properties));
    }
}
