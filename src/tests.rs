#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::{BTreeMap, HashMap};
    use std::rc::Rc;
    use std::sync::{Arc, Mutex};
    use std::thread;

    use serde_json::json;

    use crate::{HostObject, ResourceOpener, Template, Value};

    fn init() {
        let _ = env_logger::builder()
            .is_test(true)
            .filter_level(log::LevelFilter::Trace)
            .try_init();
    }

    fn render(template: &str, vars: serde_json::Value) -> String {
        init();
        Template::parse(template)
            .unwrap()
            .evaluate_json(&vars)
            .unwrap()
    }

    fn render_plain(template: &str) -> String {
        render(template, json!({}))
    }

    fn eval_error(template: &str, vars: serde_json::Value) -> String {
        init();
        Template::parse(template)
            .unwrap()
            .evaluate_json(&vars)
            .unwrap_err()
            .to_string()
    }

    fn parse_error(template: &str) -> crate::ParseError {
        init();
        match Template::parse(template) {
            Err(crate::TemplateError::Parse(e)) => e,
            Err(other) => panic!("expected a parse error, got {other}"),
            Ok(_) => panic!("expected a parse error for {template:?}"),
        }
    }

    // --- plain text and references ---

    #[test]
    fn literal_only() {
        let text = "In the reign of James the Second \n It was generally reckoned\n";
        assert_eq!(render_plain(text), text);
    }

    #[test]
    fn empty_template() {
        assert_eq!(render_plain(""), "");
    }

    #[test]
    fn dollar_without_id_is_text() {
        assert_eq!(render_plain(" $? "), " $? ");
        assert_eq!(render_plain(" $. "), " $. ");
        assert_eq!(render_plain(" $$ "), " $$ ");
    }

    #[test]
    fn hash_without_directive_is_text() {
        assert_eq!(render_plain("# if is not a directive"), "# if is not a directive");
        assert_eq!(render_plain("#<foo>"), "#<foo>");
        assert_eq!(render_plain("#bar"), "#bar");
        assert_eq!(render_plain("#breakx"), "#breakx");
        assert_eq!(render_plain("#setx"), "#setx");
    }

    #[test]
    fn double_dollar_starts_reference() {
        assert_eq!(render(" $$foo ", json!({ "foo": true })), " $true ");
        assert_eq!(render(" $${foo} ", json!({ "foo": true })), " $true ");
    }

    #[test]
    fn hash_then_reference() {
        assert_eq!(
            render("${foo}#${bar}", json!({ "foo": "xxx", "bar": "yyy" })),
            "xxx#yyy"
        );
    }

    #[test]
    fn substitute_no_braces() {
        assert_eq!(render(" $x ", json!({ "x": 1729 })), " 1729 ");
    }

    #[test]
    fn substitute_with_braces() {
        assert_eq!(render("a${x}\nb", json!({ "x": "1729" })), "a1729\nb");
    }

    #[test]
    fn brace_not_followed_by_id_is_text() {
        assert_eq!(render_plain("${??"), "${??");
        assert_eq!(render_plain("$!{??"), "$!{??");
    }

    #[test]
    fn member_suffix_must_be_a_letter() {
        // $foo.! is the reference $foo followed by the text .!
        assert_eq!(render("$foo.!", json!({ "foo": false })), "false.!");
    }

    #[test]
    fn undefined_reference_is_an_error() {
        let message = eval_error("$foo", json!({}));
        assert_eq!(message, "In expression on line 1: Undefined reference $foo");
    }

    #[test]
    fn null_cannot_be_rendered() {
        let message = eval_error("==$foo==", json!({ "foo": null }));
        assert!(message.contains("Null value for $foo"), "{message}");
    }

    #[test]
    fn silent_reference_swallows_null_and_undefined() {
        assert_eq!(render("==$!foo==", json!({ "foo": null })), "====");
        assert_eq!(render("a$!{undef}b", json!({})), "ab");
    }

    #[test]
    fn silent_reference_chain() {
        assert_eq!(render("==$!map.get(23)==", json!({ "map": {} })), "====");
        assert_eq!(render("==$!foo.bar==", json!({ "foo": null })), "====");
    }

    // --- properties, methods, indexing ---

    #[test]
    fn map_property_is_key_lookup() {
        assert_eq!(render("$map.foo", json!({ "map": { "foo": "bar" } })), "bar");
        // $map.empty is always the key "empty", never emptiness
        assert_eq!(
            render("$map.empty", json!({ "map": { "empty": "foo" } })),
            "foo"
        );
    }

    #[test]
    fn map_property_missing_key_is_null() {
        let message = eval_error("$x.null", json!({ "x": {} }));
        assert!(message.contains("Null value for $x.null"), "{message}");
    }

    #[test]
    fn nested_map_members() {
        assert_eq!(
            render("$m.inner.flag", json!({ "m": { "inner": { "flag": "ok" } } })),
            "ok"
        );
    }

    #[test]
    fn string_empty_property() {
        assert_eq!(render("#if ($s.empty)E#{else}N#end", json!({ "s": "" })), "E");
        assert_eq!(render("#if ($s.empty)E#{else}N#end", json!({ "s": "x" })), "N");
    }

    #[test]
    fn string_methods() {
        assert_eq!(render("<$s.length()>", json!({ "s": "abcde" })), "<5>");
        assert_eq!(render("$s.indexOf(\"bar\", 2)", json!({ "s": "barbarbar" })), "3");
        assert_eq!(render("$s.substring(1, 3)", json!({ "s": "abcdef" })), "bc");
        assert_eq!(render("$s.substring(2)", json!({ "s": "abcdef" })), "cdef");
        assert_eq!(render("$s.toUpperCase()", json!({ "s": "ab" })), "AB");
        assert_eq!(render("$i.toString()", json!({ "i": 5 })), "5");
    }

    #[test]
    fn string_index_out_of_range() {
        let message = eval_error("$s.substring(9)", json!({ "s": "abc" }));
        assert!(message.contains("out of range"), "{message}");
    }

    #[test]
    fn method_on_null_is_an_error() {
        let message = eval_error("$foo.bar()", json!({ "foo": null }));
        assert!(
            message.contains("In $foo.bar(): $foo must not be null"),
            "{message}"
        );
    }

    #[test]
    fn no_such_method() {
        let message = eval_error("$i.nonExistent($i)", json!({ "i": 23 }));
        assert!(
            message.contains("In $i.nonExistent($i): no method nonExistent in integer"),
            "{message}"
        );
    }

    #[test]
    fn method_wrong_argument_types() {
        let message = eval_error("$s.charAt()", json!({ "s": "" }));
        assert!(
            message.contains("parameters for method charAt have wrong types: []"),
            "{message}"
        );
        let message = eval_error("$s.charAt('x')", json!({ "s": "" }));
        assert!(
            message.contains("parameters for method charAt have wrong types: [x]"),
            "{message}"
        );
    }

    #[test]
    fn method_argument_must_be_a_primary() {
        let e = parse_error("$sb.append(2 + 3) $sb");
        assert!(e.to_string().contains("Expected )"), "{e}");
    }

    #[test]
    fn method_null_argument() {
        // null is recognized only in this exact spot, as a method argument
        assert_eq!(
            render("<$map.containsKey( null )>", json!({ "map": {} })),
            "<false>"
        );
    }

    #[test]
    fn index_into_map() {
        assert_eq!(render("<$map[\"x\"]>", json!({ "map": { "x": "y" } })), "<y>");
        assert_eq!(render("<$map[ \"x\" ]>", json!({ "map": { "x": "y" } })), "<y>");
        assert_eq!(render("<${map[\"x\"]}>", json!({ "map": { "x": "y" } })), "<y>");
    }

    #[test]
    fn index_null_result() {
        let message = eval_error("==$map[23]==", json!({ "map": {} }));
        assert!(message.contains("Null value for $map[23]"), "{message}");
        assert_eq!(render("==$!map[23]==", json!({ "map": {} })), "====");
    }

    #[test]
    fn negative_list_indices() {
        assert_eq!(
            render(
                "$list[-1] $list[-2] $list[-3]",
                json!({ "list": ["foo", "bar", "baz"] })
            ),
            "baz bar foo"
        );
    }

    #[test]
    fn list_index_out_of_range() {
        let message = eval_error("$list[17]", json!({ "list": ["foo"] }));
        assert!(
            message.contains("In $list[17]: list index 17 is not valid for list of size 1"),
            "{message}"
        );
        let message = eval_error("$list[-2]", json!({ "list": ["foo"] }));
        assert!(
            message.contains(
                "negative list index -2 counts from the end of the list, but the list size is only 1"
            ),
            "{message}"
        );
        let message = eval_error("$list[-4]", json!({ "list": ["a", "b", "c"] }));
        assert!(
            message.contains(
                "negative list index -4 counts from the end of the list, but the list size is only 3"
            ),
            "{message}"
        );
    }

    #[test]
    fn list_index_must_be_an_integer() {
        let message = eval_error("$list['x']", json!({ "list": [] }));
        assert!(
            message.contains("In $list['x']: list index is not an Integer: x"),
            "{message}"
        );
    }

    #[test]
    fn index_expression_is_rejected() {
        let e = parse_error("<$map[2 + 3]>");
        assert!(e.to_string().contains("Expected ]"), "{e}");
    }

    #[test]
    fn index_null_literal_is_rejected() {
        let e = parse_error("<$map[null]>");
        assert!(
            e.to_string()
                .contains("Identifier must be preceded by $ or be true or false: null"),
            "{e}"
        );
    }

    #[test]
    fn index_on_null_is_an_error() {
        let message = eval_error("$foo[23]", json!({ "foo": null }));
        assert!(
            message.contains("In $foo[23]: $foo must not be null"),
            "{message}"
        );
    }

    #[test]
    fn list_mutating_methods() {
        assert_eq!(
            render("$list.add(4)$list", json!({ "list": [1, 2, 3] })),
            "true[1, 2, 3, 4]"
        );
        assert_eq!(
            render("$map.put('k', 'new') $map.get('k')", json!({ "map": { "k": "old" } })),
            "old new"
        );
    }

    #[test]
    fn map_key_and_value_views() {
        assert_eq!(render("$map.keySet()", json!({ "map": { "a": 1, "b": 2 } })), "[a, b]");
        assert_eq!(render("$map.values()", json!({ "map": { "a": 1, "b": 2 } })), "[1, 2]");
    }

    // --- expressions ---

    #[test]
    fn arithmetic() {
        assert_eq!(render_plain("#set ($x = 1 + 1) $x"), " 2");
        assert_eq!(render_plain("#set ($x = 1 + 2 * 3) $x"), " 7");
        assert_eq!(render_plain("#set ($x = 22 - 7) $x"), " 15");
        assert_eq!(render_plain("#set ($x = 22 / 7) $x"), " 3");
        assert_eq!(render_plain("#set ($x = 22 % 7) $x"), " 1");
    }

    #[test]
    fn associativity() {
        assert_eq!(render_plain("#set ($x = 3 - 2 - 1) $x"), " 0");
        assert_eq!(render_plain("#set ($x = 16 / 4 / 4) $x"), " 1");
    }

    #[test]
    fn precedence() {
        assert_eq!(render_plain("#set($x=1+2+3*4*5+6)$x"), "69");
        assert_eq!(render_plain("#set ($x = 1 + 2 * 3 == 3 * 2 + 1) $x"), " true");
        assert_eq!(render_plain("#set ($x = (1 + 1 == 2)) $x"), " true");
        assert_eq!(render_plain("#set ($x = (1 + 1 != 2)) $x"), " false");
    }

    #[test]
    fn relation_precedence() {
        assert_eq!(render_plain("#set ($x = 1 < 2 == 2 < 1) $x"), " false");
        assert_eq!(render_plain("#set ($x = 2 < 1 == 2 < 1) $x"), " true");
    }

    #[test]
    fn string_concatenation() {
        assert_eq!(render_plain("#set ($x = 'foo' + 'bar') $x"), " foobar");
        assert_eq!(render_plain("#set ($x = 23 + ' skidoo') $x"), " 23 skidoo");
        assert_eq!(render_plain("#set ($x = 'heaven ' + 17) $x"), " heaven 17");
    }

    #[test]
    fn null_in_concatenation_becomes_source_text() {
        assert_eq!(
            render("#set ($x = $bar + 'foo') $x", json!({ "bar": null })),
            " $barfoo"
        );
        assert_eq!(
            render("#set ($x = 'foo' + ($bar + $bar)) $x", json!({ "bar": null })),
            " foo$bar + $bar"
        );
    }

    #[test]
    fn division_by_zero_is_null() {
        assert_eq!(
            render(
                "#set ($x = 5 / 0)#if ($x == $null) null #end",
                json!({ "null": null })
            ),
            " null "
        );
        assert_eq!(
            render(
                "#set ($x = 5 % 0)#if ($x == $null) null #end",
                json!({ "null": null })
            ),
            " null "
        );
    }

    #[test]
    fn arithmetic_on_null_is_null() {
        assert_eq!(
            render(
                "#set ($x = 1 + $null)#if ($x == $null)yes#end",
                json!({ "null": null })
            ),
            "yes"
        );
        assert_eq!(
            render(
                "#set ($x = $null * 3)#if ($x == $null)yes#end",
                json!({ "null": null })
            ),
            "yes"
        );
    }

    #[test]
    fn ordering_on_null_is_an_error() {
        let message = eval_error("#if ($foo < 1) x #end", json!({ "foo": null }));
        assert!(
            message.contains("Left operand $foo of < must not be null"),
            "{message}"
        );
        let message = eval_error("#if (1 < $foo) x #end", json!({ "foo": null }));
        assert!(
            message.contains("Right operand $foo of < must not be null"),
            "{message}"
        );
        let message = eval_error("#if ($foo >= $bar) x #end", json!({ "foo": null, "bar": null }));
        assert!(
            message.contains("Left operand $foo of >= must not be null"),
            "{message}"
        );
    }

    #[test]
    fn arithmetic_needs_integers() {
        let message = eval_error("#set ($x = 'a' < 'b')", json!({}));
        assert!(
            message.contains("Arithmetic is only available on integers, not a (a string)"),
            "{message}"
        );
    }

    #[test]
    fn word_operators() {
        assert_eq!(render_plain("#set ($x = true and false) $x"), " false");
        assert_eq!(render_plain("#set ($x = false or true) $x"), " true");
        assert_eq!(render_plain("#set ($x = not false) $x"), " true");
        assert_eq!(render_plain("#set ($x = !true) $x"), " false");
    }

    #[test]
    fn misspelled_word_operators() {
        let e = parse_error("#if (no true) what #end");
        assert!(
            e.to_string()
                .contains("Identifier must be preceded by $ or be true or false"),
            "{e}"
        );
        let e = parse_error("#if (true oor false) what #end");
        assert!(e.to_string().contains("Expected 'or' but was 'oor"), "{e}");
        let e = parse_error("#if (true andd false) what #end");
        assert!(e.to_string().contains("Expected 'and' but was 'andd"), "{e}");
        // there is no xor operator, so the expression just stops
        let e = parse_error("#if (true xor false) what #end");
        assert!(e.to_string().contains("Expected )"), "{e}");
    }

    #[test]
    fn half_an_operator() {
        let e = parse_error("#if (1 ! 2) x #end");
        assert!(e.to_string().contains("Expected !=, not just !"), "{e}");
    }

    #[test]
    fn truthiness() {
        // empty strings and collections are true; only null and false are not
        assert_eq!(render("#set ($x = $e && true) $x", json!({ "e": "" })), " true");
        assert_eq!(render("#set ($x = $e && true) $x", json!({ "e": [] })), " true");
        assert_eq!(render("#set ($x = $f && true) $x", json!({ "f": false })), " false");
    }

    #[test]
    fn integer_literals() {
        assert_eq!(render_plain("#set ($x = 0) $x"), " 0");
        assert_eq!(render_plain("#set ($x = -1) $x"), " -1");
        assert_eq!(render_plain("#set ($x = 2147483647) $x"), " 2147483647");
        assert_eq!(render_plain("#set ($x = -2147483648) $x"), " -2147483648");
    }

    #[test]
    fn integer_literal_overflow() {
        let e = parse_error("#set ($x = 2147483648)");
        assert!(e.to_string().contains("Invalid integer: 2147483648"), "{e}");
    }

    #[test]
    fn funky_equality() {
        assert_eq!(render_plain("#set ($t = (123 == \"123\")) $t"), " true");
        assert_eq!(render_plain("#set ($f = (123 == \"1234\")) $f"), " false");
        assert_eq!(render_plain("#set ($x = (true != 'true')) $x"), " false");
    }

    #[test]
    fn same_type_equality_is_structural() {
        assert_eq!(
            render_plain("#set ($a = [1, 2])#set ($b = [1, 2])#if ($a == $b)same#end"),
            "same"
        );
    }

    #[test]
    fn null_equals_null() {
        assert_eq!(render("#if ($foo == $foo) yes #end", json!({ "foo": null })), " yes ");
    }

    // --- list and range literals ---

    #[test]
    fn list_literals() {
        assert_eq!(render_plain("#set ($list = []) $list"), " []");
        assert_eq!(render_plain("#set ($list = ['a', 'b', 'c']) $list"), " [a, b, c]");
        assert_eq!(render_plain("#set ($list = [ 1,2,3 ] ) $list"), " [1, 2, 3]");
        assert_eq!(
            render("#foreach ($x in [$a, $b]) $x #end", json!({ "a": 5, "b": 3 })),
            " 5  3 "
        );
        assert_eq!(
            render("#set ($list = [ $null, $null ]) $list.size()", json!({ "null": null })),
            " 2"
        );
    }

    #[test]
    fn list_elements_are_primaries_only() {
        let e = parse_error("#set ($list = [2 + 3])");
        assert!(e.to_string().contains("Expected ] at end of list literal"), "{e}");
    }

    #[test]
    fn range_literals() {
        assert_eq!(render_plain("#set ($range = [1..5]) $range"), " [1, 2, 3, 4, 5]");
        assert_eq!(render_plain("#set ($range = [5 .. 1]) $range"), " [5, 4, 3, 2, 1]");
        assert_eq!(render_plain("#foreach ($x in [-1 .. 1]) $x #end"), " -1  0  1 ");
        assert_eq!(
            render("#foreach ($x in [$a..$b]) $x #end", json!({ "a": 3, "b": 5 })),
            " 3  4  5 "
        );
    }

    #[test]
    fn range_bounds_are_primaries_only() {
        let e = parse_error("#set ($list = [2 * 3 .. 10])");
        assert!(e.to_string().contains("Expected ] at end of list literal"), "{e}");
        let e = parse_error("#set ($list = [10 .. 2 * 3])");
        assert!(e.to_string().contains("Expected ] at end of range literal"), "{e}");
    }

    #[test]
    fn range_bounds_must_be_integers() {
        let message = eval_error("#set ($range = ['foo'..'bar'])", json!({}));
        assert!(
            message.contains("Arithmetic is only available on integers"),
            "{message}"
        );
    }

    // --- #if ---

    #[test]
    fn if_true_no_else() {
        assert_eq!(render_plain("x#if (true)y #end z"), "xy  z");
        assert_eq!(render_plain("x#if (true)y #end\nz"), "xy z");
    }

    #[test]
    fn if_false_no_else() {
        assert_eq!(render_plain("x#if (false)y #end z"), "x z");
    }

    #[test]
    fn if_with_else() {
        assert_eq!(render_plain("x#if (true) a #else b #end z"), "x a  z");
        assert_eq!(render_plain("x#if (false) a #else b #end z"), "x b  z");
    }

    #[test]
    fn if_with_elseif() {
        assert_eq!(render_plain("x#if (false) a #elseif (true) b #else c #end z"), "x b  z");
        assert_eq!(render_plain("x#if (false) a #elseif (false) b #else c #end z"), "x c  z");
    }

    #[test]
    fn braced_directives() {
        assert_eq!(render_plain("x#{if}(false)a#{elseif}(false)b#{else}c#{end}z"), "xcz");
    }

    #[test]
    fn undefined_is_false_in_if_conditions() {
        assert_eq!(render_plain("#if ($undefined) really? #else indeed #end"), " indeed ");
        assert_eq!(
            render("#if ($false || $undefined) nope #else yes #end", json!({ "false": false })),
            " yes "
        );
        assert_eq!(
            render("#if ($true && $undefined) nope #else yes #end", json!({ "true": true })),
            " yes "
        );
        assert_eq!(render_plain("#if (!$undefined) yes #else nope #end"), " yes ");
    }

    #[test]
    fn undefined_is_false_only_for_plain_references() {
        let message = eval_error("#if ($foo.bar) oops #end", json!({}));
        assert!(message.contains("Undefined reference $foo"), "{message}");
        let message = eval_error("#if ($foo.bar()) oops #end", json!({}));
        assert!(message.contains("Undefined reference $foo"), "{message}");
        let message = eval_error("#if ($foo[0]) oops #end", json!({}));
        assert!(message.contains("Undefined reference $foo"), "{message}");
        let message = eval_error("#if ($u1 == $u2) yes #else nope #end", json!({}));
        assert!(message.contains("Undefined reference $u1"), "{message}");
    }

    #[test]
    fn undefined_is_false_only_inside_if() {
        let message = eval_error("#set ($foo = !$undefined) $foo", json!({}));
        assert!(message.contains("Undefined reference $undefined"), "{message}");
        let message = eval_error(
            "#set ($foo = $false || $undefined) $foo",
            json!({ "false": false }),
        );
        assert!(message.contains("Undefined reference $undefined"), "{message}");
    }

    #[test]
    fn null_reference_in_if_is_false() {
        assert_eq!(render("#if ($nullRef) oops #end", json!({ "nullRef": null })), "");
    }

    // --- #set and whitespace elision ---

    #[test]
    fn simple_set() {
        assert_eq!(
            render("$x#set ($x = 17)#set ($y = 23) ($x, $y)", json!({ "x": 1 })),
            "1 (17, 23)"
        );
    }

    #[test]
    fn newline_after_set_is_skipped() {
        assert_eq!(render_plain("foo #set ($x = 17)\nbar"), "foo bar");
    }

    #[test]
    fn newline_inside_set_is_fine() {
        assert_eq!(render_plain("foo #set ($x\n  = 17)\nbar $x"), "foo bar 17");
    }

    #[test]
    fn set_does_not_mutate_caller_vars() {
        init();
        let template = Template::parse("#set ($x = 1)$x").unwrap();
        let vars: BTreeMap<String, Value> = BTreeMap::new();
        assert_eq!(template.evaluate(&vars).unwrap(), "1");
        assert!(vars.is_empty());
    }

    #[test]
    fn space_before_set_after_reference_is_elided() {
        assert_eq!(render("$x  #set ($x = 0)x", json!({ "x": "!" })), "!x");
        assert_eq!(render("$x#set ($x = 0)x", json!({ "x": "!" })), "!x");
    }

    #[test]
    fn newline_before_set_after_reference_is_kept() {
        assert_eq!(render("$x\n#set ($x = 0)x", json!({ "x": "!" })), "!\nx");
        assert_eq!(render("$x\n\n  #set ($x = 0)x", json!({ "x": "!" })), "!\n\n  x");
    }

    #[test]
    fn non_whitespace_before_set_is_kept() {
        assert_eq!(render_plain("x #set ($x = 0)x"), "x x");
        assert_eq!(render_plain("x#set ($x = 0)x"), "xx");
    }

    #[test]
    fn leading_space_before_set_is_elided() {
        assert_eq!(render_plain("  #set ($x = 1)"), "");
        // but not when it contains newlines
        assert_eq!(render_plain("\n\n#set ($x = 3)\n"), "\n\n");
    }

    #[test]
    fn space_before_set_after_directive_is_elided() {
        assert_eq!(render_plain("#set($x = 0)\n  #set($y = 1)\n<$x$y>"), "<01>");
        assert_eq!(render_plain("x#set ($foo = 'bar')\n#set ($baz = 'buh')\n!"), "x!");
        // after a directive, even whitespace with newlines goes
        assert_eq!(render_plain("#set ($x = 1)\n\n#set ($y = 2)\n$x$y"), "12");
        assert_eq!(render_plain("x#if (1 + 1 == 2) ok #else ? #end  #set ($foo = 'bar')\ny"), "x ok y");
    }

    #[test]
    fn space_before_set_after_comment_is_elided() {
        assert_eq!(render_plain("x ## comment\n  #set($x = 0)  y"), "x   y");
        assert_eq!(render_plain("x #* comment *#    #set($x = 0)  y"), "x   y");
        assert_eq!(render_plain("## c\n\n\n#set ($x = 1)$x"), "1");
    }

    #[test]
    fn leading_space_before_set_in_macro_body() {
        assert_eq!(
            render_plain("#macro (m)\n\n\n#set ($foo = 17)hello\n#end#m()"),
            "hello\n"
        );
        assert_eq!(
            render_plain("#macro (m)\n  #set ($foo = 17)hello\n#end#m()"),
            "hello\n"
        );
    }

    // --- #foreach ---

    #[test]
    fn foreach_over_list() {
        assert_eq!(render("x#foreach ($x in $c) <$x> #end y", json!({ "c": [] })), "x y");
        assert_eq!(
            render("x#foreach ($x in $c) <$x> #end y", json!({ "c": ["foo", "bar", "baz"] })),
            "x <foo>  <bar>  <baz>  y"
        );
        assert_eq!(render_plain("#foreach ($x in [1,2,3]) $x #end"), " 1  2  3 ");
    }

    #[test]
    fn foreach_over_map_iterates_values_in_key_order() {
        assert_eq!(
            render("x#foreach ($x in $c)<$x>#end y", json!({ "c": { "foo": "bar", "baz": "buh" } })),
            "x<buh><bar> y"
        );
    }

    #[test]
    fn foreach_over_null_does_nothing() {
        assert_eq!(render("#foreach ($x in $null) $x #end", json!({ "null": null })), "");
    }

    #[test]
    fn foreach_over_non_iterable_is_an_error() {
        let message = eval_error("#foreach ($x in 23) $x #end", json!({}));
        assert!(message.contains("Not iterable: 23"), "{message}");
    }

    #[test]
    fn foreach_bad_variable() {
        let e = parse_error("#foreach (x in $c) <$x> #end");
        assert!(e.to_string().contains("Expected variable beginning with '$' for #foreach"), "{e}");
        let e = parse_error("#foreach ($x.foo in $c) <$x> #end");
        assert!(e.to_string().contains("Expected simple variable for #foreach"), "{e}");
        let e = parse_error("#foreach ($ in $c) #end");
        assert!(e.to_string().contains("Expected simple variable for #foreach"), "{e}");
    }

    #[test]
    fn foreach_braced_and_silent_variables() {
        assert_eq!(render("#foreach (${x} in [1,2])$x#end", json!({})), "12");
        assert_eq!(render("#foreach ($!{x} in [1,2])$x#end", json!({})), "12");
    }

    #[test]
    fn foreach_loop_state() {
        assert_eq!(
            render("#foreach ($x in $list)[$foreach.index]#end", json!({ "list": ["a", "b", "c"] })),
            "[0][1][2]"
        );
        assert_eq!(
            render("#foreach ($x in $list)[$foreach.count]#end", json!({ "list": ["a", "b", "c"] })),
            "[1][2][3]"
        );
        assert_eq!(
            render(
                "x#foreach ($x in $c) <$x#if ($foreach.hasNext), #end> #end y",
                json!({ "c": ["foo", "bar", "baz"] })
            ),
            "x <foo, >  <bar, >  <baz>  y"
        );
        assert_eq!(
            render(
                "#foreach ($x in $c)#if ($foreach.first)<#end$x#if ($foreach.last)>#end#end",
                json!({ "c": [1, 2, 3] })
            ),
            "<123>"
        );
    }

    #[test]
    fn foreach_variable_is_restored() {
        assert_eq!(
            render("$x #foreach ($x in $list)[$x]#end $x", json!({ "x": 23, "list": [1] })),
            "23 [1] 23"
        );
    }

    #[test]
    fn foreach_set_of_other_variables_persists() {
        assert_eq!(
            render("#foreach ($x in $list)#set ($other = 'inside')#end$other", json!({ "list": [1] })),
            "inside"
        );
    }

    #[test]
    fn nested_foreach_restores_loop_state() {
        assert_eq!(
            render(
                "#foreach ($x in $l)[$foreach.index#foreach ($y in $l)($foreach.index)#end]#end",
                json!({ "l": [1, 2] })
            ),
            "[0(0)(1)][1(0)(1)]"
        );
    }

    #[test]
    fn foreach_value_renders_as_braces() {
        assert_eq!(render_plain("#foreach ($x in [1..2])[$foreach]#end"), "[{}][{}]");
    }

    // --- #break ---

    #[test]
    fn break_in_foreach() {
        assert_eq!(
            render_plain("#foreach ($x in [1..10])$x#if ($x == 5)#break#end#end"),
            "12345"
        );
        assert_eq!(
            render_plain("#foreach ($x in [1..10])$x#if ($x == 5)#break ($foreach)#end#end"),
            "12345"
        );
    }

    #[test]
    fn break_scope_is_checked_by_value() {
        assert_eq!(
            render_plain("#foreach ($x in [1..10])$x#set ($f = $foreach)#if ($x == 3)#break($f)#end#end"),
            "123"
        );
    }

    #[test]
    fn break_at_top_level_keeps_output_so_far() {
        assert_eq!(render_plain("foo bar #break baz"), "foo bar ");
    }

    #[test]
    fn break_unsupported_scope() {
        let message = eval_error(
            "#foreach ($x in [1..10])#break($null)#end",
            json!({ "null": null }),
        );
        assert!(
            message.contains("Argument to #break is not a supported scope: $null"),
            "{message}"
        );
        let message = eval_error("#set ($x = 17) #break($x)", json!({}));
        assert!(
            message.contains("Argument to #break is not a supported scope: $x"),
            "{message}"
        );
    }

    #[test]
    fn break_foreach_outside_foreach() {
        let message = eval_error("foo #break($foreach) baz", json!({}));
        assert!(message.contains("Undefined reference $foreach"), "{message}");
        // a captured loop state escaping its loop is an error at the root
        let message = eval_error(
            "#foreach ($x in [1..2])#set ($f = $foreach)#end#break($f)",
            json!({}),
        );
        assert!(message.contains("#break($foreach) is not inside a #foreach"), "{message}");
    }

    #[test]
    fn break_missing_close_paren() {
        let e = parse_error("#foreach ($x in [1..10]) $x #break($foreach #end");
        assert!(e.to_string().contains("Expected )"), "{e}");
    }

    // --- macros ---

    #[test]
    fn simple_macro() {
        assert_eq!(
            render_plain("xyz\n#macro (m)\nhello world\n#end\n#m() abc #m()\n"),
            "xyz\nhello world\n abc hello world\n"
        );
    }

    #[test]
    fn macro_with_args() {
        let template =
            "#macro (m $x $y)#if ($x < $y)less#{else}greater#end#end#m(17 23) #m(23 17) #m(17 17)";
        assert_eq!(render_plain(template), "less greater greater");
    }

    #[test]
    fn macro_args_with_commas() {
        let template = "#macro (sum $x $y $z)#set ($s = $x + $y + $z)$s#end#sum ($l[0],$l.get(1),5)";
        assert_eq!(render(template, json!({ "l": [3, 4] })), "12");
    }

    #[test]
    fn macro_args_with_spaces() {
        let template = "#macro (sum $x $y $z)#set ($s = $x + $y + $z)$s#end#sum ($l[0] $l.get(1) 5)";
        assert_eq!(render(template, json!({ "l": [3, 4] })), "12");
    }

    #[test]
    fn forward_macro_reference() {
        assert_eq!(render_plain("#m(17)#macro (m $x)!$x!#end"), "!17!");
    }

    #[test]
    fn first_macro_definition_wins() {
        // macros are extracted at parse time, so the textually first
        // definition wins even in a branch that never runs
        let template = "#if (false)#macro (m)foo#end#else#macro (m)bar#end#end#m()";
        assert_eq!(render_plain(template), "foo");
    }

    #[test]
    fn undefined_macro_call() {
        let message = eval_error("#oops()", json!({}));
        assert!(
            message.contains("#oops is neither a standard directive nor a macro that has been defined"),
            "{message}"
        );
    }

    #[test]
    fn macro_argument_count_mismatch() {
        let message = eval_error("#macro (twoArgs $a $b) $a $b #end#twoArgs(23)", json!({}));
        assert!(
            message.contains("Wrong number of arguments to #twoArgs: expected 2, got 1"),
            "{message}"
        );
    }

    #[test]
    fn recursive_macro() {
        let template = "#macro (m $s)$s#if (!$s.isEmpty())#m($s.substring(1))#end#end#m('abc')";
        assert_eq!(render_plain(template), "abcbcc");
    }

    #[test]
    fn call_by_name_evaluation_counts() {
        init();
        let template = Template::parse(
            "#macro(never $p)-#end#macro(twice $p)$p$p#end#never($list.add(1))#twice($list.add(2))",
        )
        .unwrap();
        let backing = Rc::new(RefCell::new(Vec::new()));
        let mut vars = BTreeMap::new();
        vars.insert("list".to_string(), Value::List(backing.clone()));
        let output = template.evaluate(&vars).unwrap();
        assert_eq!(output, "-truetrue");
        // the unused argument was never evaluated; the used one, twice
        assert_eq!(backing.borrow().len(), 2);
    }

    #[test]
    fn set_shadows_macro_parameter() {
        let template = "#macro(swap $a $b)$a $b becomes #set($tmp = $a)#set($a = $b)#set($b = $tmp)$a $b#end#swap('a', 'b')";
        assert_eq!(render_plain(template), "a b becomes b a");
    }

    #[test]
    fn name_capture_swap() {
        // $b is the name $tmp, so setting $tmp changes what $b means
        let template = "#macro(ncs $a $b)$a $b becomes #set($tmp = $a)#set($a = $b)#set($b = $tmp)$a $b#end#set($x = \"a\")#set($tmp = \"b\")#ncs($x $tmp)";
        assert_eq!(render_plain(template), "a b becomes a a");
    }

    #[test]
    fn errors_in_macros_name_the_macro() {
        init();
        let error = Template::parse("#macro (m $x)$x.length()#end#m(23)")
            .unwrap()
            .evaluate_json(&json!({}))
            .unwrap_err();
        let message = error.to_string();
        assert!(message.contains("In macro #m defined on line 1:"), "{message}");
        assert!(message.contains("no method length in integer"), "{message}");
        assert!(std::error::Error::source(&error).is_some());
    }

    // --- #@macro bodies ---

    #[test]
    fn macro_with_body() {
        assert_eq!(
            render_plain("#macro(wrap $x)[$x $bodyContent $x]#end#@wrap('a')inner#end"),
            "[a inner a]"
        );
    }

    #[test]
    fn body_content_is_undefined_without_body() {
        assert_eq!(
            render_plain("#macro(wrap)#if ($bodyContent)Y#{else}N#end#end#wrap()"),
            "N"
        );
    }

    #[test]
    fn nested_macro_bodies() {
        let template = "#macro(outer)($bodyContent)#end#macro(inner)[$bodyContent]#end#@outer()a#@inner()b#end{c}#end";
        assert_eq!(render_plain(template), "(a[b]{c})");
    }

    #[test]
    fn at_sign_without_call_is_text() {
        assert_eq!(render_plain("#@ foo"), "#@ foo");
        assert_eq!(render_plain("#@foo no parens"), "#@foo no parens");
    }

    // --- #define ---

    #[test]
    fn define_basics() {
        assert_eq!(render_plain("#define ($hello)world#end$hello $hello"), "world world");
        assert_eq!(render_plain("#define ($hello)23#end#set ($hello = 17)$hello"), "17");
        assert_eq!(render_plain("#set ($hello = 17)#define ($hello)23#end$hello"), "23");
    }

    #[test]
    fn define_memoizes_per_definition() {
        assert_eq!(
            render("#define ($d)#set ($x = $x + 1)$x#end$d$d $x", json!({ "x": 0 })),
            "11 1"
        );
    }

    #[test]
    fn define_recursion_terminates_on_its_own_updates() {
        let template = "#define ($recur)$x#set ($x = $x - 1)#if ($x > 0)$recur#end#end#set ($x = 3)$recur";
        assert_eq!(render_plain(template), "321");
    }

    #[test]
    fn define_value_cannot_be_dereferenced() {
        let message = eval_error("#define ($h)x#end#set ($y = $h.foo)", json!({}));
        assert!(message.contains("comes from #define"), "{message}");
        let message = eval_error("#define ($h)x#end#set ($y = $h.foo())", json!({}));
        assert!(message.contains("comes from #define"), "{message}");
        let message = eval_error("#define ($h)x#end#set ($y = $h[0])", json!({}));
        assert!(message.contains("comes from #define"), "{message}");
    }

    // --- strings as mini-templates ---

    #[test]
    fn double_quoted_strings_interpolate() {
        assert_eq!(render("#set ($s = \"$x\") <$s>", json!({ "x": "fred" })), " <fred>");
        assert_eq!(
            render("#set ($s = \"==$x$y\") <$s>", json!({ "x": "fred", "y": "jim" })),
            " <==fredjim>"
        );
        assert_eq!(render_plain("#set ($s = \"abc#if (true)yes#{else}no#{end}def\")$s"), "abcyesdef");
    }

    #[test]
    fn single_quoted_strings_are_verbatim() {
        assert_eq!(render("#set ($s = 'a${b}c')x${s}y", json!({ "b": 23 })), "xa${b}cy");
    }

    #[test]
    fn string_operations_on_interpolation() {
        assert_eq!(render("#set ($s = \"a${b}c\")$s.length()", json!({ "b": 23 })), "4");
    }

    #[test]
    fn loop_state_inside_string() {
        assert_eq!(
            render(
                "#foreach ($a in $list)#set ($s = \"T${foreach.index}\")$s#end",
                json!({ "list": ["x", "y"] })
            ),
            "T0T1"
        );
    }

    #[test]
    fn macro_called_from_string() {
        assert_eq!(
            render_plain("#set ($s = \"<#double(17)>\")#macro(double $n)#set ($x = 2 * $n)$x#end$s"),
            "<34>"
        );
    }

    #[test]
    fn silent_reference_in_string() {
        assert_eq!(
            render("#set ($nuller = \"$!{null}er\")$nuller", json!({ "null": null })),
            "er"
        );
    }

    #[test]
    fn unterminated_string() {
        let e = parse_error("#set ($x = 'abc)");
        assert!(e.to_string().contains("Unterminated string constant"), "{e}");
    }

    #[test]
    fn string_escapes_are_rejected() {
        let e = parse_error("#set ($x = 'a\\b')");
        assert!(
            e.to_string().contains("Escapes in string constants are not currently supported"),
            "{e}"
        );
    }

    // --- comments and verbatim blocks ---

    #[test]
    fn line_comment() {
        assert_eq!(render_plain("line 1 ##comment\nline 2"), "line 1 line 2");
    }

    #[test]
    fn block_comment() {
        assert_eq!(render_plain("foo #* blah\nblah *# bar"), "foo  bar");
        assert_eq!(render_plain("foo #*# bar *# baz"), "foo  baz");
        // an unterminated block comment is quietly accepted
        assert_eq!(render_plain("foo\nbar #*\nblah\nblah"), "foo\nbar ");
    }

    #[test]
    fn verbatim_blocks() {
        assert_eq!(render_plain("#[[]]#"), "");
        assert_eq!(render_plain("x#[[]]#y"), "xy");
        assert_eq!(
            render_plain("#[[$notAReference #notADirective]]#"),
            "$notAReference #notADirective"
        );
        assert_eq!(render_plain("#[[ [[  ]]  ]#  ]]#"), " [[  ]]  ]#  ");
        assert_eq!(render_plain("#[ foo"), "#[ foo");
    }

    #[test]
    fn unterminated_verbatim_block() {
        let e = parse_error("foo\nbar #[[\nblah\nblah");
        assert_eq!(e.line(), 2);
        assert_eq!(
            e.to_string(),
            "Unterminated #[[ - did not see matching ]]#, on line 2"
        );
    }

    // --- reserved directives ---

    #[test]
    fn stop_is_not_supported() {
        let e = parse_error("#stop");
        assert!(e.to_string().contains("#stop is not currently supported"), "{e}");
    }

    #[test]
    fn end_words_are_rejected() {
        let e = parse_error("#endx");
        assert!(e.to_string().contains("Unrecognized directive #endx"), "{e}");
    }

    #[test]
    fn unknown_directive_with_parens_is_an_undefined_macro() {
        let message = eval_error("#include('x.vm')", json!({}));
        assert!(message.contains("is neither a standard directive nor a macro"), "{message}");
    }

    // --- parse error diagnostics ---

    #[test]
    fn parse_error_location_and_context() {
        let e = parse_error("line 1\nline 2\nbar${foo.!}baz");
        assert_eq!(e.line(), 3);
        assert_eq!(e.to_string(), "Expected }, on line 3, at text starting: .!}baz");
    }

    #[test]
    fn parse_error_context_is_truncated() {
        let e = parse_error("#if (true#aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        assert!(e.to_string().contains("..."), "{e}");
    }

    #[test]
    fn found_stop_outside_construct() {
        let e = parse_error("#end");
        assert!(e.to_string().contains("Found #end outside any construct"), "{e}");
        let e = parse_error("#foreach ($x in [1])#else#end");
        assert!(e.to_string().contains("Found #else parsing #foreach starting on line 1"), "{e}");
    }

    // --- #parse and #evaluate ---

    #[derive(Debug)]
    struct MapOpener {
        resources: HashMap<String, String>,
        opened: Mutex<Vec<String>>,
    }

    impl MapOpener {
        fn new(resources: &[(&str, &str)]) -> Arc<MapOpener> {
            Arc::new(MapOpener {
                resources: resources
                    .iter()
                    .map(|(name, text)| (name.to_string(), text.to_string()))
                    .collect(),
                opened: Mutex::new(Vec::new()),
            })
        }

        fn opened(&self) -> Vec<String> {
            self.opened.lock().unwrap().clone()
        }
    }

    impl ResourceOpener for Arc<MapOpener> {
        fn open_resource(&self, resource_name: Option<&str>) -> std::io::Result<String> {
            let name = resource_name.unwrap_or_default();
            self.opened.lock().unwrap().push(name.to_string());
            match self.resources.get(name) {
                Some(text) => Ok(text.clone()),
                None => Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    name.to_string(),
                )),
            }
        }
    }

    #[test]
    fn parse_directive_grafts_macros_and_sets() {
        init();
        let opener = MapOpener::new(&[
            (
                "outer.vm",
                "start\n#macro (mac)outer#end#parse ('nested.vm')#mac() #dec('x') $baz end",
            ),
            (
                "nested.vm",
                "[nested]#macro (dec $a)<$a>#end#macro (mac)nested#end#mac()#set ($baz = 23)",
            ),
        ]);
        let template = Template::parse_resource("outer.vm", opener.clone()).unwrap();
        let output = template.evaluate_json(&json!({})).unwrap();
        // the outer definition of #mac wins over the nested one, both in the
        // nested render and afterwards
        assert_eq!(output, "start\n[nested]outerouter <x> 23 end");

        // a second evaluation starts from a clean macro registry and reuses
        // the parse cache instead of reopening nested.vm
        let again = template.evaluate_json(&json!({})).unwrap();
        assert_eq!(again, output);
        assert_eq!(opener.opened(), vec!["outer.vm".to_string(), "nested.vm".to_string()]);
    }

    #[test]
    fn parse_directive_with_expression_argument() {
        init();
        let opener = MapOpener::new(&[
            ("outer.vm", "A#parse (\"${which}.vm\")B"),
            ("one.vm", "1"),
            ("two.vm", "2"),
        ]);
        let template = Template::parse_resource("outer.vm", opener.clone()).unwrap();
        assert_eq!(template.evaluate_json(&json!({ "which": "one" })).unwrap(), "A1B");
        assert_eq!(template.evaluate_json(&json!({ "which": "two" })).unwrap(), "A2B");
        // each nested resource was opened exactly once
        assert_eq!(
            opener.opened(),
            vec!["outer.vm".to_string(), "one.vm".to_string(), "two.vm".to_string()]
        );
    }

    #[test]
    fn parse_directive_argument_must_be_a_string() {
        init();
        let opener = MapOpener::new(&[("outer.vm", "#parse(23)")]);
        let message = Template::parse_resource("outer.vm", opener)
            .unwrap()
            .evaluate_json(&json!({}))
            .unwrap_err()
            .to_string();
        assert!(
            message.contains("Argument to #parse must be a string, not integer"),
            "{message}"
        );
    }

    #[test]
    fn parse_directive_wraps_nested_parse_errors() {
        init();
        let opener = MapOpener::new(&[("outer.vm", "#parse('bad.vm')"), ("bad.vm", "#end")]);
        let error = Template::parse_resource("outer.vm", opener)
            .unwrap()
            .evaluate_json(&json!({}))
            .unwrap_err();
        assert!(error.to_string().contains("Found #end"), "{error}");
        assert!(std::error::Error::source(&error).is_some());
    }

    #[test]
    fn parse_directive_wraps_missing_resources() {
        init();
        let opener = MapOpener::new(&[("outer.vm", "#parse('missing.vm')")]);
        let error = Template::parse_resource("outer.vm", opener)
            .unwrap()
            .evaluate_json(&json!({}))
            .unwrap_err();
        assert!(error.to_string().contains("missing.vm"), "{error}");
        assert!(std::error::Error::source(&error).is_some());
    }

    #[test]
    fn parse_without_opener_fails() {
        let message = eval_error("#parse('x.vm')", json!({}));
        assert!(message.contains("no resource opener"), "{message}");
    }

    #[test]
    fn break_ends_only_the_nested_parse() {
        init();
        let opener = MapOpener::new(&[("outer.vm", "A#parse('n.vm')B"), ("n.vm", "x#break y")]);
        let template = Template::parse_resource("outer.vm", opener).unwrap();
        assert_eq!(template.evaluate_json(&json!({})).unwrap(), "AxB");
    }

    #[test]
    fn foreach_break_crosses_a_parse_boundary() {
        init();
        let opener = MapOpener::new(&[
            ("outer.vm", "#foreach ($i in [1..3])$i#parse('b.vm')#end"),
            ("b.vm", "x#if ($i == 2)#break($foreach)#end"),
        ]);
        let template = Template::parse_resource("outer.vm", opener).unwrap();
        assert_eq!(template.evaluate_json(&json!({})).unwrap(), "1x2x");
    }

    #[test]
    fn nested_template_errors_name_their_resource() {
        init();
        let opener = MapOpener::new(&[("outer.vm", "#parse('nested.vm')"), ("nested.vm", "$bar")]);
        let message = Template::parse_resource("outer.vm", opener)
            .unwrap()
            .evaluate_json(&json!({}))
            .unwrap_err()
            .to_string();
        assert!(message.contains("of nested.vm"), "{message}");
        assert!(message.contains("Undefined reference $bar"), "{message}");
    }

    #[test]
    fn evaluate_directive() {
        assert_eq!(render("#evaluate('foo $x bar')", json!({ "x": "baz" })), "foo baz bar");
        assert_eq!(render_plain("#evaluate('foo #set ($x = 17) $x bar')"), "foo  17 bar");
        assert_eq!(
            render("#evaluate($x) $y", json!({ "x": "#set ($y = 'foo')" })),
            " foo"
        );
        assert_eq!(render("#evaluate($null)", json!({ "null": null })), "");
    }

    #[test]
    fn evaluate_directive_nested() {
        assert_eq!(
            render_plain("#set($nested = '#set ($y = \"foo\")')#evaluate('#evaluate ($nested)')$y"),
            "foo"
        );
    }

    #[test]
    fn evaluate_argument_must_be_a_string() {
        let message = eval_error("#evaluate(23)", json!({}));
        assert!(
            message.contains("Argument to #evaluate must be a string: 23"),
            "{message}"
        );
    }

    #[test]
    fn break_ends_only_the_evaluate() {
        assert_eq!(render("A#evaluate('x#break y')B", json!({})), "AxB");
    }

    // --- host objects ---

    #[derive(Debug)]
    struct Widget {
        name: String,
        size: i32,
    }

    impl HostObject for Widget {
        fn get_property(&self, name: &str) -> Result<Option<Value>, String> {
            match name {
                "name" => Ok(Some(Value::String(self.name.clone()))),
                "size" => Ok(Some(Value::Int(self.size))),
                "missing" => Ok(Some(Value::Null)),
                _ => Ok(None),
            }
        }

        fn call_method(&self, name: &str, args: &[Value]) -> Result<Option<Value>, String> {
            match (name, args) {
                ("describe", []) => Ok(Some(Value::String(format!("{} ({})", self.name, self.size)))),
                ("scaled", [Value::Int(n)]) => Ok(Some(Value::Int(self.size * n))),
                ("scaled", _) => Err("ambiguous method invocation, could be one of:\n  scaled(int)\n  scaled(String)".to_string()),
                ("get", [Value::String(key)]) => Ok(Some(Value::String(format!("<{key}>")))),
                _ => Ok(None),
            }
        }

        fn display(&self) -> String {
            format!("Widget[{}]", self.name)
        }

        fn try_iter(&self) -> Option<Vec<Value>> {
            Some((1..=self.size).map(Value::Int).collect())
        }
    }

    fn widget_vars() -> BTreeMap<String, Value> {
        let mut vars = BTreeMap::new();
        vars.insert(
            "w".to_string(),
            Value::object(Widget {
                name: "gadget".to_string(),
                size: 3,
            }),
        );
        vars
    }

    fn render_widget(template: &str) -> Result<String, crate::EvaluationError> {
        init();
        Template::parse(template).unwrap().evaluate(&widget_vars())
    }

    #[test]
    fn host_object_properties_and_methods() {
        assert_eq!(render_widget("$w.name/$w.size").unwrap(), "gadget/3");
        assert_eq!(render_widget("$w.describe()").unwrap(), "gadget (3)");
        assert_eq!(render_widget("$w.scaled(4)").unwrap(), "12");
    }

    #[test]
    fn host_object_display_and_iteration() {
        assert_eq!(render_widget("$w").unwrap(), "Widget[gadget]");
        assert_eq!(render_widget("#foreach ($i in $w)$i#end").unwrap(), "123");
    }

    #[test]
    fn host_object_index_falls_back_to_get() {
        assert_eq!(render_widget("$w['k']").unwrap(), "<k>");
    }

    #[test]
    fn host_object_null_property_cannot_render() {
        let message = render_widget("$w.missing").unwrap_err().to_string();
        assert!(message.contains("Null value for $w.missing"), "{message}");
    }

    #[test]
    fn host_object_missing_members() {
        let message = render_widget("$w.nosuch").unwrap_err().to_string();
        assert!(
            message.contains("member nosuch does not correspond to a property of Widget[gadget]"),
            "{message}"
        );
        let message = render_widget("$w.nothing()").unwrap_err().to_string();
        assert!(message.contains("no method nothing in object"), "{message}");
    }

    #[test]
    fn host_object_reported_failures_surface() {
        let message = render_widget("$w.scaled('x')").unwrap_err().to_string();
        assert!(message.contains("ambiguous method invocation"), "{message}");
    }

    // --- templates are reusable and shareable ---

    #[test]
    fn evaluations_are_independent() {
        init();
        let template = Template::parse("#set ($x = $x + 1)$x").unwrap();
        assert_eq!(template.evaluate_json(&json!({ "x": 1 })).unwrap(), "2");
        assert_eq!(template.evaluate_json(&json!({ "x": 10 })).unwrap(), "11");
    }

    #[test]
    fn template_can_be_evaluated_from_many_threads() {
        init();
        let template = Arc::new(Template::parse("#foreach ($i in [1..3])$i#end").unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let template = Arc::clone(&template);
                thread::spawn(move || template.evaluate_json(&json!({})).unwrap())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), "123");
        }
    }

    #[test]
    fn evaluate_json_requires_an_object() {
        init();
        let template = Template::parse("x").unwrap();
        let message = template.evaluate_json(&json!([1, 2])).unwrap_err().to_string();
        assert!(message.contains("must be a JSON object"), "{message}");
    }
}
