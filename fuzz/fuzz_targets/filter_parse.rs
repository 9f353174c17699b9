#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use spark_registry::{Filter, Properties, PropertyValue};

/// Fuzz 输入：一段过滤器文本与一组用于求值的属性。
///
/// - **Why**：过滤器文本来自部署配置，解析器与求值器必须对任意输入保持全函数语义；
/// - **How**：解析成功后渲染为规范形式并再次解析，同时在随机属性上求值；
/// - **What**：不 panic；规范形式可重入；否定恰好翻转求值结果。
#[derive(Debug, Arbitrary)]
struct FilterCase {
    text: String,
    properties: Vec<(String, PropertyInput)>,
}

#[derive(Debug, Arbitrary)]
enum PropertyInput {
    Bool(bool),
    Int(i64),
    Str(String),
    List(Vec<String>),
}

fuzz_target!(|case: FilterCase| {
    let Ok(filter) = Filter::parse(&case.text) else {
        return;
    };

    let rendered = filter.to_string();
    assert_eq!(
        Filter::parse(&rendered).as_ref(),
        Ok(&filter),
        "规范形式必须可重入：{rendered}"
    );

    let mut properties = Properties::new();
    for (key, value) in case.properties.into_iter().take(8) {
        properties = match value {
            PropertyInput::Bool(flag) => properties.with(key, flag),
            PropertyInput::Int(number) => properties.with(key, number),
            PropertyInput::Str(text) => properties.with(key, text),
            PropertyInput::List(items) => properties.with(
                key,
                PropertyValue::List(items.into_iter().map(PropertyValue::from).collect()),
            ),
        };
    }
    let negated = Filter::Not(Box::new(filter.clone()));
    assert_ne!(filter.matches(&properties), negated.matches(&properties));
});
