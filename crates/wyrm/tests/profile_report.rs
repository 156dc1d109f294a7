//! Profile report shape: run a hot loop, dump the heatmap, check the HTML.

use std::time::Duration;

use wyrm::{CollectStringPrint, Engine};

const HOT_LOOP: &str = "fn work(n) { return n * 2; }\n\
                        let i = 0;\n\
                        while (i < 100000) { i = work(i) / 2 + 1; }\n\
                        print(i);";

#[test]
fn heatmap_renders_sampled_spans() {
    let mut engine = Engine::new();
    // a zero stride samples at every safe point, keeping the test
    // independent of wall-clock speed
    engine.enable_profiling_with_stride(Duration::ZERO);
    let (source, module) = engine.parse("hot.wy", HOT_LOOP).unwrap();
    let mut print = CollectStringPrint::new();
    engine.run_module(&module, &mut print).unwrap();
    assert_eq!(print.output(), "100000\n");

    let samples = engine.profile().expect("profiling is enabled").direct_samples();
    assert!(samples > 0, "the hot loop never got sampled");

    let mut out = Vec::new();
    engine.dump_profile(source, &mut out).unwrap();
    let html = String::from_utf8(out).expect("report is valid UTF-8");

    assert!(html.starts_with("<!DOCTYPE html>"), "{html}");
    assert!(html.contains("<pre>") && html.contains("</pre>"));
    // at least one span carries direct heat
    assert!(html.contains("background-color:#ff"), "no heated span in report");
    assert!(html.contains("font-weight:"), "no weight styling in report");
    // spans nest properly
    assert_eq!(html.matches("<span").count(), html.matches("</span>").count());
    // the source text survives, with angle brackets escaped
    assert!(html.contains("while (i &lt; 100000)"), "{html}");
}

#[test]
fn report_without_profiling_is_plain_source() {
    let mut engine = Engine::new();
    let (source, module) = engine.parse("cold.wy", "print(1 < 2);").unwrap();
    let mut print = CollectStringPrint::new();
    engine.run_module(&module, &mut print).unwrap();

    let mut out = Vec::new();
    engine.dump_profile(source, &mut out).unwrap();
    let html = String::from_utf8(out).unwrap();
    assert!(html.contains("print(1 &lt; 2);"), "{html}");
    assert!(!html.contains("<span"), "unsampled report should carry no spans");
}
